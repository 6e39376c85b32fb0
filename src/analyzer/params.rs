//! Parameter types configuring the analysis stages.
//!
//! [`AnalyzerParams`] nests one parameter block per stage. Every block
//! implements `Default` with the tuned defaults and deserializes with
//! missing fields filled from those defaults, so a JSON document only needs
//! the values it changes:
//!
//! ```json
//! { "detection": { "method": "legacy", "threshold": { "percentile": 92 } } }
//! ```
//!
//! The thresholds are empirical. Treat them as starting points for
//! re-tuning on representative calibration data rather than as fixed
//! contracts.

use crate::error::{AnalysisError, Result};
use crate::estimate::EstimatorParams;
use crate::shapes::ShapeParams;
use crate::signal::ConditioningParams;
use crate::transitions::DetectionParams;
use crate::validate::ValidationParams;
use serde::{Deserialize, Serialize};

/// Analysis-wide parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerParams {
    /// Minimum number of samples accepted by `analyze`.
    pub min_points: usize,
    pub conditioning: ConditioningParams,
    pub estimator: EstimatorParams,
    pub detection: DetectionParams,
    pub shapes: ShapeParams,
    pub validation: ValidationParams,
}

impl Default for AnalyzerParams {
    fn default() -> Self {
        Self {
            min_points: 12,
            conditioning: ConditioningParams::default(),
            estimator: EstimatorParams::default(),
            detection: DetectionParams::default(),
            shapes: ShapeParams::default(),
            validation: ValidationParams::default(),
        }
    }
}

impl AnalyzerParams {
    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        let t = &d.threshold;
        let f = &self.shapes.fitting;
        let checks: [(bool, &str); 13] = [
            (self.min_points >= 4, "min_points must be at least 4"),
            (
                d.min_segment_points >= 5,
                "detection.min_segment_points must be at least 5",
            ),
            (
                (0.0..=100.0).contains(&t.percentile),
                "detection.threshold.percentile must lie in [0, 100]",
            ),
            (
                (0.0..=t.percentile).contains(&t.min_percentile),
                "detection.threshold.min_percentile must lie in [0, percentile]",
            ),
            (
                (0.0..1.0).contains(&d.variance_threshold),
                "detection.variance_threshold must lie in [0, 1)",
            ),
            (
                (0.0..=0.5).contains(&d.merge_threshold),
                "detection.merge_threshold must lie in [0, 0.5]",
            ),
            (
                d.stability_jump_sigma > 0.0 && d.score_sigma > 0.0,
                "detection sigmas must be positive",
            ),
            (
                d.split_f_threshold >= 0.0 && d.min_relative_misfit >= 0.0,
                "detection split thresholds must be non-negative",
            ),
            (f.max_evaluations > 0, "shapes.fitting.max_evaluations must be positive"),
            (
                f.cone_smoothing_sigma > 0.0 && f.guess_smoothing_sigma > 0.0,
                "shapes.fitting sigmas must be positive",
            ),
            (
                self.shapes.classifier.smoothing_sigma > 0.0,
                "shapes.classifier.smoothing_sigma must be positive",
            ),
            (
                self.estimator.min_structure_snr >= 0.0,
                "estimator.min_structure_snr must be non-negative",
            ),
            (
                self.validation.variance_threshold >= 0.0,
                "validation.variance_threshold must be non-negative",
            ),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(AnalysisError::InvalidConfig((*msg).to_string())),
            None => Ok(()),
        }
    }
}
