//! Signal conditioning: from `(height, volume)` samples to a smoothed
//! cross-sectional area profile.
//!
//! Overview
//! - The raw area is the local slope of the volume curve, computed with
//!   central differences. Tiny height steps are clamped to `height_epsilon`.
//! - The raw profile then runs through a fixed-order cascade: running median
//!   (spike removal), wide local-linear least squares, an adaptive Gaussian
//!   and a second, narrower Gaussian.
//! - Every stage is an attempt that may be rejected (oversized window,
//!   singular local fit, non-finite output). A rejected stage abandons the
//!   cascade and the raw profile is smoothed with a fixed double Gaussian
//!   instead. That terminal path cannot fail.
//!
//! The conditioned profile feeds the derivative analyzer, the count
//! estimator and the transition candidates. Boundary refinement and shape
//! fitting work on the measured volumes and the raw area.

pub mod filters;

use crate::error::{AnalysisError, Result};
use crate::types::Sample;
use filters::{convolve_clamped, gaussian_kernel, sample_gradient, FilterError, FilterStage};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub use filters::{gaussian_smooth, gradient, local_linear_smooth, median_filter};

/// Sigmas of the unconditional fallback pass, applied in order.
const FALLBACK_SIGMAS: [f64; 2] = [3.0, 2.0];

/// Knobs for the conditioning cascade. Each stage can be switched off; the
/// order is fixed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditioningParams {
    pub median: bool,
    pub local_linear: bool,
    pub gaussian: bool,
    pub gaussian_refine: bool,
    /// Overrides the length-derived median window (forced odd).
    pub median_window: Option<usize>,
    /// Smallest height step accepted as a finite-difference denominator.
    pub height_epsilon: f64,
}

impl Default for ConditioningParams {
    fn default() -> Self {
        Self {
            median: true,
            local_linear: true,
            gaussian: true,
            gaussian_refine: true,
            median_window: None,
            height_epsilon: 1e-9,
        }
    }
}

/// Area profile derived from one set of samples.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaProfile {
    pub heights: Vec<f64>,
    pub volumes: Vec<f64>,
    /// Unfiltered finite-difference area.
    pub raw_area: Vec<f64>,
    /// Area after the conditioning cascade.
    pub area: Vec<f64>,
}

impl AreaProfile {
    pub fn len(&self) -> usize {
        self.heights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }

    pub fn height_span(&self) -> f64 {
        match (self.heights.first(), self.heights.last()) {
            (Some(a), Some(b)) => b - a,
            _ => 0.0,
        }
    }

    pub fn volume_span(&self) -> f64 {
        match (self.volumes.first(), self.volumes.last()) {
            (Some(a), Some(b)) => b - a,
            _ => 0.0,
        }
    }
}

/// What the cascade actually did.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditioningReport {
    pub stages: Vec<FilterStage>,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

/// Derive and condition the area profile.
pub fn condition(samples: &[Sample], params: &ConditioningParams) -> Result<AreaProfile> {
    condition_with_report(samples, params).map(|(profile, _)| profile)
}

/// Same as [`condition`] but also reports the filters that were applied.
pub fn condition_with_report(
    samples: &[Sample],
    params: &ConditioningParams,
) -> Result<(AreaProfile, ConditioningReport)> {
    check_samples(samples)?;
    let heights: Vec<f64> = samples.iter().map(|s| s.height).collect();
    let volumes: Vec<f64> = samples.iter().map(|s| s.volume).collect();
    let raw_area = raw_area(&heights, &volumes, params.height_epsilon);

    let (area, report) = match run_cascade(&heights, &raw_area, params) {
        Ok((area, stages)) => (
            area,
            ConditioningReport {
                stages,
                fallback_used: false,
                rejected: None,
            },
        ),
        Err(err) => {
            warn!("condition: cascade rejected ({err}), using fixed double gaussian");
            let (area, stages) = fallback_smoothing(&raw_area);
            (
                area,
                ConditioningReport {
                    stages,
                    fallback_used: true,
                    rejected: Some(err.to_string()),
                },
            )
        }
    };
    debug!(
        "condition: n={} stages={} fallback={}",
        heights.len(),
        report.stages.len(),
        report.fallback_used
    );

    Ok((
        AreaProfile {
            heights,
            volumes,
            raw_area,
            area,
        },
        report,
    ))
}

fn check_samples(samples: &[Sample]) -> Result<()> {
    if samples.len() < 3 {
        return Err(AnalysisError::degenerate(format!(
            "{} samples cannot define an area profile",
            samples.len()
        )));
    }
    if samples
        .iter()
        .any(|s| !s.height.is_finite() || !s.volume.is_finite())
    {
        return Err(AnalysisError::degenerate("non-finite sample"));
    }
    if let Some(i) = samples.windows(2).position(|w| w[1].height < w[0].height) {
        return Err(AnalysisError::degenerate(format!(
            "height decreases after sample {i}"
        )));
    }
    let span = samples[samples.len() - 1].height - samples[0].height;
    if span <= 0.0 {
        return Err(AnalysisError::degenerate("profile has zero height span"));
    }
    Ok(())
}

/// Central-difference `dV/dh` with the step clamped to `eps`.
pub fn raw_area(heights: &[f64], volumes: &[f64], eps: f64) -> Vec<f64> {
    let n = heights.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(1);
            let hi = (i + 1).min(n.saturating_sub(1));
            (volumes[hi] - volumes[lo]) / (heights[hi] - heights[lo]).max(eps)
        })
        .collect()
}

/// Median window derived from the profile length: `max(3, n / 15)`, odd.
pub fn median_window(len: usize) -> usize {
    make_odd((len / 15).max(3))
}

/// Primary and fallback windows of the local-linear stage.
pub fn local_linear_windows(len: usize) -> [usize; 2] {
    [(len / 3 * 2 + 1).max(11), len / 2 * 2 + 1]
}

/// `clamp(2 + 0.3 * rms(gradient), 1.5, 4.0)`, gradient in samples.
pub fn adaptive_sigma(values: &[f64]) -> f64 {
    let grad = sample_gradient(values);
    let rms = if grad.is_empty() {
        0.0
    } else {
        (grad.iter().map(|g| g * g).sum::<f64>() / grad.len() as f64).sqrt()
    };
    (2.0 + 0.3 * rms).clamp(1.5, 4.0)
}

fn make_odd(w: usize) -> usize {
    if w % 2 == 0 {
        w + 1
    } else {
        w
    }
}

#[derive(Clone, Copy, Debug)]
enum CascadeStep {
    Median,
    LocalLinear,
    AdaptiveGaussian,
    RefineGaussian,
}

fn run_cascade(
    heights: &[f64],
    raw: &[f64],
    params: &ConditioningParams,
) -> std::result::Result<(Vec<f64>, Vec<FilterStage>), FilterError> {
    let steps = [
        (CascadeStep::Median, params.median),
        (CascadeStep::LocalLinear, params.local_linear),
        (CascadeStep::AdaptiveGaussian, params.gaussian),
        (CascadeStep::RefineGaussian, params.gaussian_refine),
    ];

    let n = raw.len();
    let mut current = raw.to_vec();
    let mut applied = Vec::new();
    let mut sigma: Option<f64> = None;

    for (step, enabled) in steps {
        if !enabled {
            continue;
        }
        match step {
            CascadeStep::Median => {
                let window = make_odd(params.median_window.unwrap_or_else(|| median_window(n)));
                let stage = FilterStage::Median { window };
                current = stage.apply(heights, &current)?;
                applied.push(stage);
            }
            CascadeStep::LocalLinear => {
                let [primary, wider] = local_linear_windows(n);
                let primary_stage = FilterStage::LocalLinear { window: primary };
                match primary_stage.apply(heights, &current) {
                    Ok(out) => {
                        current = out;
                        applied.push(primary_stage);
                    }
                    Err(err) => {
                        let window = wider.min(largest_odd_at_most(n));
                        debug!("condition: local-linear window {primary} rejected ({err}), retrying with {window}");
                        let stage = FilterStage::LocalLinear { window };
                        current = stage.apply(heights, &current)?;
                        applied.push(stage);
                    }
                }
            }
            CascadeStep::AdaptiveGaussian => {
                let s = adaptive_sigma(&current);
                sigma = Some(s);
                let stage = FilterStage::Gaussian { sigma: s };
                current = stage.apply(heights, &current)?;
                applied.push(stage);
            }
            CascadeStep::RefineGaussian => {
                let base = sigma.unwrap_or_else(|| adaptive_sigma(&current));
                let stage = FilterStage::Gaussian { sigma: base * 0.7 };
                current = stage.apply(heights, &current)?;
                applied.push(stage);
            }
        }
    }
    Ok((current, applied))
}

fn largest_odd_at_most(n: usize) -> usize {
    if n % 2 == 1 {
        n
    } else {
        n.saturating_sub(1)
    }
}

fn fallback_smoothing(raw: &[f64]) -> (Vec<f64>, Vec<FilterStage>) {
    let mut current = raw.to_vec();
    let mut stages = Vec::with_capacity(FALLBACK_SIGMAS.len());
    for sigma in FALLBACK_SIGMAS {
        current = convolve_clamped(&current, &gaussian_kernel(sigma));
        stages.push(FilterStage::Gaussian { sigma });
    }
    (current, stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cylinder_samples(n: usize, radius: f64, height: f64) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let h = height * i as f64 / (n - 1) as f64;
                Sample::new(h, std::f64::consts::PI * radius * radius * h)
            })
            .collect()
    }

    #[test]
    fn cylinder_area_is_flat() {
        let samples = cylinder_samples(40, 2.0, 10.0);
        let (profile, report) =
            condition_with_report(&samples, &ConditioningParams::default()).unwrap();
        let expected = std::f64::consts::PI * 4.0;
        for a in &profile.area {
            assert!((a - expected).abs() < 1e-9 * expected, "area {a}");
        }
        assert!(!report.fallback_used);
        assert_eq!(report.stages.len(), 4);
    }

    #[test]
    fn window_sizes_follow_length() {
        assert_eq!(median_window(12), 3);
        assert_eq!(median_window(50), 3);
        assert_eq!(median_window(90), 7);
        assert_eq!(local_linear_windows(50), [33, 51]);
        assert_eq!(local_linear_windows(12), [11, 13]);
    }

    #[test]
    fn median_override_is_forced_odd() {
        let samples = cylinder_samples(20, 1.0, 5.0);
        let params = ConditioningParams {
            median_window: Some(0),
            ..Default::default()
        };
        let (_, report) = condition_with_report(&samples, &params).unwrap();
        assert!(!report.fallback_used);
        assert_eq!(report.stages[0], FilterStage::Median { window: 1 });
    }

    #[test]
    fn zero_span_is_degenerate() {
        let samples: Vec<Sample> = (0..15).map(|i| Sample::new(1.0, i as f64)).collect();
        let err = condition(&samples, &ConditioningParams::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::DegenerateInput { .. }));
    }

    #[test]
    fn repeated_heights_are_clamped_not_rejected() {
        let mut samples = cylinder_samples(20, 1.0, 5.0);
        samples[10].height = samples[9].height;
        let profile = condition(&samples, &ConditioningParams::default()).unwrap();
        assert!(profile.raw_area.iter().all(|a| a.is_finite()));
    }

    #[test]
    fn adaptive_sigma_is_bounded() {
        assert!((adaptive_sigma(&[1.0; 10]) - 2.0).abs() < 1e-12);
        let steep: Vec<f64> = (0..10).map(|i| i as f64 * 100.0).collect();
        assert!((adaptive_sigma(&steep) - 4.0).abs() < 1e-12);
    }
}
