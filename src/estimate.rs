//! Segment-count estimation by a three-way heuristic vote.
//!
//! The estimate is advisory: it only routes the transition detector between
//! its strategies and never fixes the number of segments.
//!
//! Votes
//! - sign changes of the significant part of `d²A/dh²`: `1 + changes / 2`;
//! - positions where the normalised change of curvature exceeds a fixed
//!   threshold: `1 + count / 2`;
//! - interior maxima of a sliding-window variance of the area: `1 + peaks`.
//!
//! Each vote is capped at 3 and the median wins. Agreement sets the
//! confidence: unanimous is high, two of three is medium, otherwise low.
//!
//! The vote thresholds are relative to the profile's own extremes, so on a
//! profile whose whole variation is noise they would count the noise. The
//! votes therefore only run when the conditioned area varies by more than
//! `min_structure_snr` times the residual removed by conditioning (the
//! derivative stage's SNR). Below that the profile is treated as one
//! featureless segment and all three votes are 1.

use crate::derivatives::Derivatives;
use crate::signal::filters::{mean, median_in_place};
use crate::signal::AreaProfile;
use crate::types::{Confidence, SegmentCount};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorParams {
    /// Fraction of `max |d²A|` below which curvature is ignored for sign changes.
    pub curvature_significance: f64,
    /// Normalised curvature-change level counted by the second vote.
    pub curvature_change_threshold: f64,
    /// Window of the variance vote as a fraction of the profile length.
    pub variance_window_fraction: f64,
    /// Variance peaks must exceed this multiple of the median variance.
    pub variance_peak_ratio: f64,
    /// SNR below which the profile carries no structure to vote on.
    pub min_structure_snr: f64,
}

impl Default for EstimatorParams {
    fn default() -> Self {
        Self {
            curvature_significance: 0.1,
            curvature_change_threshold: 0.5,
            variance_window_fraction: 0.1,
            variance_peak_ratio: 1.2,
            min_structure_snr: 1.5,
        }
    }
}

/// Result of the vote.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountEstimate {
    pub count: SegmentCount,
    pub confidence: Confidence,
    /// Individual votes: sign changes, curvature changes, variance peaks.
    pub votes: [usize; 3],
}

/// Predict the number of segments from the conditioned profile.
pub fn predict_segment_count(
    profile: &AreaProfile,
    derivatives: &Derivatives,
    params: &EstimatorParams,
) -> CountEstimate {
    if derivatives.snr < params.min_structure_snr {
        debug!(
            "predict_segment_count: snr={:.3} below {}, no structure above noise",
            derivatives.snr, params.min_structure_snr
        );
        return CountEstimate {
            count: SegmentCount::One,
            confidence: Confidence::High,
            votes: [1; 3],
        };
    }
    let scale = curvature_scale(profile);
    let votes = [
        sign_change_vote(&derivatives.second, scale, params),
        curvature_change_vote(&derivatives.second, scale, params),
        variance_peak_vote(&profile.area, params),
    ];
    let mut sorted = votes;
    sorted.sort_unstable();
    let median = sorted[1];
    let confidence = if votes[0] == votes[1] && votes[1] == votes[2] {
        Confidence::High
    } else if votes[0] == votes[1] || votes[1] == votes[2] || votes[0] == votes[2] {
        Confidence::Medium
    } else {
        Confidence::Low
    };
    debug!(
        "predict_segment_count: votes={:?} median={} confidence={:?}",
        votes, median, confidence
    );
    CountEstimate {
        count: SegmentCount::from_votes(median),
        confidence,
        votes,
    }
}

/// Typical `d²A/dh²` magnitude of a strongly curved profile of this size;
/// used as an absolute floor so that round-off on flat profiles is not
/// mistaken for curvature.
fn curvature_scale(profile: &AreaProfile) -> f64 {
    let span = profile.height_span().max(f64::EPSILON);
    let peak = profile.area.iter().fold(0.0f64, |m, a| m.max(a.abs()));
    peak / (span * span)
}

fn sign_change_vote(second: &[f64], scale: f64, params: &EstimatorParams) -> usize {
    let peak = second.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let floor = (params.curvature_significance * peak).max(1e-3 * scale);
    let mut changes = 0usize;
    let mut last_sign = 0.0f64;
    for &v in second {
        if v.abs() < floor {
            continue;
        }
        let sign = v.signum();
        if last_sign != 0.0 && sign != last_sign {
            changes += 1;
        }
        last_sign = sign;
    }
    (1 + changes / 2).min(3)
}

fn curvature_change_vote(second: &[f64], scale: f64, params: &EstimatorParams) -> usize {
    let deltas: Vec<f64> = second.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    let peak = deltas.iter().fold(0.0f64, |m, v| m.max(*v));
    if peak <= 1e-3 * scale {
        return 1;
    }
    let count = deltas
        .iter()
        .filter(|d| *d / peak > params.curvature_change_threshold)
        .count();
    (1 + count / 2).min(3)
}

fn variance_peak_vote(area: &[f64], params: &EstimatorParams) -> usize {
    let n = area.len();
    let window = ((n as f64 * params.variance_window_fraction) as usize).max(5);
    if n < window + 2 {
        return 1;
    }
    let variances: Vec<f64> = area
        .windows(window)
        .map(|w| {
            let m = mean(w);
            w.iter().map(|v| (v - m).powi(2)).sum::<f64>() / w.len() as f64
        })
        .collect();
    let level = mean(area).abs().max(f64::EPSILON);
    let floor = 1e-8 * level * level;
    let mut scratch = variances.clone();
    let cut = (params.variance_peak_ratio * median_in_place(&mut scratch)).max(floor);
    let peaks = (1..variances.len().saturating_sub(1))
        .filter(|&i| {
            variances[i] > cut && variances[i] > variances[i - 1] && variances[i] >= variances[i + 1]
        })
        .count();
    (1 + peaks).min(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivatives::analyze_derivatives;
    use crate::signal::{condition, ConditioningParams};
    use crate::types::Sample;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn estimate(samples: &[Sample]) -> CountEstimate {
        let profile = condition(samples, &ConditioningParams::default()).unwrap();
        let d = analyze_derivatives(&profile);
        predict_segment_count(&profile, &d, &EstimatorParams::default())
    }

    #[test]
    fn flat_cylinder_votes_one_unanimously() {
        let samples: Vec<Sample> = (0..50)
            .map(|i| Sample::new(i as f64, 25.0 * std::f64::consts::PI * i as f64))
            .collect();
        let est = estimate(&samples);
        assert_eq!(est.count, SegmentCount::One);
        assert_eq!(est.confidence, Confidence::High);
        assert_eq!(est.votes, [1, 1, 1]);
    }

    #[test]
    fn noise_on_a_flat_cylinder_is_not_structure() {
        let clean: Vec<Sample> = (0..50)
            .map(|i| Sample::new(i as f64, 25.0 * std::f64::consts::PI * i as f64))
            .collect();
        // Two percent of the volume step between samples.
        let sigma = 0.02 * 25.0 * std::f64::consts::PI;
        for seed in 1..=10u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let noisy: Vec<Sample> = clean
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    if i == 0 {
                        return *s;
                    }
                    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                    let u2: f64 = rng.gen();
                    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                    Sample::new(s.height, s.volume + sigma * z)
                })
                .collect();
            let est = estimate(&noisy);
            assert_eq!(est.count, SegmentCount::One, "seed {seed}: {est:?}");
            assert_eq!(est.votes, [1, 1, 1], "seed {seed}");
        }
    }

    #[test]
    fn structure_gate_can_be_disabled() {
        // A wiggle smaller than the residual the conditioning removed.
        let area: Vec<f64> = (0..40).map(|i| 10.0 + 0.5 * (0.9 * i as f64).sin()).collect();
        let raw_area = area
            .iter()
            .enumerate()
            .map(|(i, a)| if i % 2 == 0 { a + 1.0 } else { a - 1.0 })
            .collect();
        let profile = AreaProfile {
            heights: (0..40).map(|i| i as f64).collect(),
            volumes: vec![0.0; 40],
            raw_area,
            area,
        };
        let d = analyze_derivatives(&profile);
        assert!(d.snr < 1.5, "snr={}", d.snr);
        let gated = predict_segment_count(&profile, &d, &EstimatorParams::default());
        assert_eq!(gated.votes, [1, 1, 1]);
        let params = EstimatorParams {
            min_structure_snr: 0.0,
            ..EstimatorParams::default()
        };
        let ungated = predict_segment_count(&profile, &d, &params);
        assert_eq!(ungated.count, SegmentCount::ThreeOrMore, "{ungated:?}");
    }

    #[test]
    fn votes_are_capped() {
        let wiggle: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let params = EstimatorParams::default();
        assert_eq!(sign_change_vote(&wiggle, 1.0, &params), 3);
        assert_eq!(curvature_change_vote(&wiggle, 1.0, &params), 3);
    }

    #[test]
    fn variance_vote_sees_isolated_bumps() {
        let mut area = vec![10.0; 80];
        for i in 20..24 {
            area[i] = 14.0;
        }
        let params = EstimatorParams::default();
        assert_eq!(variance_peak_vote(&area, &params), 2);
    }
}
