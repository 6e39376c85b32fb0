use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Wall-clock time spent in one analysis stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    pub label: String,
    pub elapsed_ms: f64,
}

/// Per-stage timings of one `analyze` call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingBreakdown {
    pub total_ms: f64,
    pub stages: Vec<StageTiming>,
}

impl TimingBreakdown {
    /// Record the time elapsed since `started` under `label`.
    pub fn record(&mut self, label: impl Into<String>, started: Instant) {
        self.stages.push(StageTiming {
            label: label.into(),
            elapsed_ms: elapsed_ms(started),
        });
    }

    pub fn stage_ms(&self, label: &str) -> Option<f64> {
        self.stages
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.elapsed_ms)
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn record_stores_milliseconds_under_the_label() {
        let mut timings = TimingBreakdown::default();
        let started = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        timings.record("conditioning", started);
        let ms = timings.stage_ms("conditioning").unwrap();
        assert!(ms >= 2.0, "{ms}");
        assert!(ms <= elapsed_ms(started));
        assert!(timings.stage_ms("validation").is_none());
    }
}
