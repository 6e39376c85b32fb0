//! Transition (segment boundary) detection.
//!
//! Overview
//! - Two strategies propose candidate positions on the conditioned profile:
//!   [`percentile`] (peaks of a combined derivative score, suited to one or
//!   two segments) and [`stability`] (step changes of the stability metric,
//!   suited to three or more).
//! - [`routing`] picks the strategy from the segment-count estimate, or runs
//!   both and keeps the boundaries they agree on.
//! - [`refine`] turns candidates into boundaries: each candidate opens a
//!   search for the best piecewise-cubic split of its bracket on the measured
//!   volumes, and the split must pass the variance and significance tests.
//!
//! When the preferred strategy yields no accepted boundary the percentile
//! candidates are tried before settling for a single segment. A single
//! segment result is flagged as low confidence.

pub mod percentile;
pub mod refine;
pub mod routing;
pub mod stability;

use crate::derivatives::{Derivatives, PercentilePolicy};
use crate::estimate::CountEstimate;
use crate::signal::AreaProfile;
use crate::types::{Confidence, DetectionMethod};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub use percentile::{combined_score, percentile_candidates};
pub use refine::{cubic_sse, place_boundaries, BoundaryEvaluation, Rejection};
pub use routing::{choose_route, reconcile, Route};
pub use stability::stability_candidates;

/// Which detection pipeline runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionMethod {
    /// Percentile-peak strategy only.
    Legacy,
    /// Count-routed hybrid of both strategies.
    Improved,
}

/// Knobs of the transition detector.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    pub method: TransitionMethod,
    pub threshold: PercentilePolicy,
    /// Minimum relative reduction of residual variance a boundary must bring.
    pub variance_threshold: f64,
    /// Boundaries closer than this fraction of the profile length merge.
    pub merge_threshold: f64,
    /// Minimum number of samples per segment (shared end points included).
    pub min_segment_points: usize,
    pub use_selective_detection: bool,
    pub selective_confidence_threshold: Confidence,
    /// Stability jumps must exceed this many standard deviations of `dS`.
    pub stability_jump_sigma: f64,
    /// F statistic a split must exceed.
    pub split_f_threshold: f64,
    /// Single-cubic misfit floor as a fraction of the bracket volume span.
    pub min_relative_misfit: f64,
    /// Matching distance for reconciled boundaries, fraction of the length.
    pub reconcile_tolerance: f64,
    pub first_weight: f64,
    pub second_weight: f64,
    /// Sigma (samples) used to smooth detection scores.
    pub score_sigma: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            method: TransitionMethod::Improved,
            threshold: PercentilePolicy::default(),
            variance_threshold: 0.14,
            merge_threshold: 0.12,
            min_segment_points: 12,
            use_selective_detection: true,
            selective_confidence_threshold: Confidence::Medium,
            stability_jump_sigma: 1.5,
            split_f_threshold: 6.0,
            min_relative_misfit: 1e-3,
            reconcile_tolerance: 0.05,
            first_weight: 0.6,
            second_weight: 0.4,
            score_sigma: 1.0,
        }
    }
}

impl DetectionParams {
    /// Merge distance in samples for a profile of `len` samples.
    pub fn merge_distance(&self, len: usize) -> usize {
        ((self.merge_threshold * len as f64).ceil() as usize).max(1)
    }

    fn reconcile_distance(&self, len: usize) -> usize {
        ((self.reconcile_tolerance * len as f64).ceil() as usize).max(1)
    }
}

/// A hypothesised boundary.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionCandidate {
    pub index: usize,
    pub score: f64,
    pub confidence: Confidence,
}

impl TransitionCandidate {
    /// Grade a candidate by how far its score clears the strategy threshold.
    pub fn new(index: usize, score: f64, threshold: f64) -> Self {
        let ratio = if threshold > 0.0 {
            score / threshold
        } else {
            f64::INFINITY
        };
        let confidence = if ratio >= 2.0 {
            Confidence::High
        } else if ratio >= 1.3 {
            Confidence::Medium
        } else {
            Confidence::Low
        };
        Self {
            index,
            score,
            confidence,
        }
    }
}

/// Candidates of one strategy plus the threshold they cleared.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSet {
    pub candidates: Vec<TransitionCandidate>,
    pub threshold: f64,
}

impl CandidateSet {
    pub(crate) fn empty(threshold: f64) -> Self {
        Self {
            candidates: Vec::new(),
            threshold,
        }
    }
}

/// Everything the detector decided for one profile.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOutcome {
    /// Ordered boundaries including the first and last sample index.
    pub boundaries: Vec<usize>,
    pub method: DetectionMethod,
    pub route: Route,
    pub percentile: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentile_candidates: Option<CandidateSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability_candidates: Option<CandidateSet>,
    pub evaluations: Vec<BoundaryEvaluation>,
    /// True when no internal boundary survived.
    pub low_confidence: bool,
}

/// Locate segment boundaries.
pub fn detect_transitions(
    profile: &AreaProfile,
    derivatives: &Derivatives,
    estimate: &CountEstimate,
    params: &DetectionParams,
) -> DetectionOutcome {
    let n = profile.len();
    let route = choose_route(estimate, params);
    let detection_percentile = params.threshold.percentile_for(derivatives.snr);
    debug!(
        "detect_transitions: n={} route={:?} percentile={:.1}",
        n, route, detection_percentile
    );

    let percentile_set = match route {
        Route::Percentile | Route::Both => Some(percentile_candidates(
            derivatives,
            detection_percentile,
            params,
        )),
        Route::Stability => None,
    };
    let stability_set = match route {
        Route::Stability | Route::Both => Some(stability_candidates(derivatives, params)),
        Route::Percentile => None,
    };

    let (primary, method) = match route {
        Route::Percentile => (
            percentile_set
                .as_ref()
                .map(|s| s.candidates.clone())
                .unwrap_or_default(),
            DetectionMethod::Percentile,
        ),
        Route::Stability => (
            stability_set
                .as_ref()
                .map(|s| s.candidates.clone())
                .unwrap_or_default(),
            DetectionMethod::Stability,
        ),
        Route::Both => {
            let p = percentile_set
                .as_ref()
                .map(|s| s.candidates.as_slice())
                .unwrap_or_default();
            let s = stability_set
                .as_ref()
                .map(|s| s.candidates.as_slice())
                .unwrap_or_default();
            let agreed = reconcile(p, s, params.reconcile_distance(n));
            if agreed.is_empty() {
                (p.to_vec(), DetectionMethod::PercentileFallback)
            } else {
                (agreed, DetectionMethod::Reconciled)
            }
        }
    };

    let (mut boundaries, mut evaluations) = place_boundaries(profile, &primary, params);
    let mut method = method;
    let mut percentile_set = percentile_set;

    let preferred_other = matches!(
        method,
        DetectionMethod::Stability | DetectionMethod::Reconciled
    );
    if boundaries.len() == 2 && preferred_other {
        let fallback = percentile_set
            .take()
            .unwrap_or_else(|| percentile_candidates(derivatives, detection_percentile, params));
        let (b, e) = place_boundaries(profile, &fallback.candidates, params);
        evaluations.extend(e);
        if b.len() > 2 {
            warn!(
                "detect_transitions: {:?} found no boundary, percentile candidates gave {}",
                method,
                b.len() - 2
            );
            method = DetectionMethod::PercentileFallback;
            boundaries = b;
        }
        percentile_set = Some(fallback);
    }

    finish(
        boundaries,
        method,
        route,
        detection_percentile,
        percentile_set,
        stability_set,
        evaluations,
    )
}

fn finish(
    boundaries: Vec<usize>,
    method: DetectionMethod,
    route: Route,
    percentile: f64,
    percentile_candidates: Option<CandidateSet>,
    stability_candidates: Option<CandidateSet>,
    evaluations: Vec<BoundaryEvaluation>,
) -> DetectionOutcome {
    let low_confidence = boundaries.len() <= 2;
    if low_confidence {
        warn!("detect_transitions: no internal boundary validated, using a single segment");
    }
    DetectionOutcome {
        boundaries,
        method,
        route,
        percentile,
        percentile_candidates,
        stability_candidates,
        evaluations,
        low_confidence,
    }
}

/// Index range where a boundary leaves at least `min_points` samples on
/// both sides (shared boundary sample included).
pub(crate) fn admissible_range(len: usize, min_points: usize) -> Option<(usize, usize)> {
    let m = min_points.max(2);
    let lo = m - 1;
    let hi = len.checked_sub(m)?;
    (lo <= hi).then_some((lo, hi))
}

/// Keep the strongest candidate among any group closer than `distance`.
pub(crate) fn suppress_nearby(
    mut candidates: Vec<TransitionCandidate>,
    distance: usize,
) -> Vec<TransitionCandidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
    let mut kept: Vec<TransitionCandidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if kept.iter().all(|k| k.index.abs_diff(c.index) >= distance) {
            kept.push(c);
        }
    }
    kept.sort_by_key(|c| c.index);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_confidence_tracks_threshold_margin() {
        assert_eq!(TransitionCandidate::new(1, 2.5, 1.0).confidence, Confidence::High);
        assert_eq!(TransitionCandidate::new(1, 1.5, 1.0).confidence, Confidence::Medium);
        assert_eq!(TransitionCandidate::new(1, 1.1, 1.0).confidence, Confidence::Low);
    }

    #[test]
    fn admissible_range_respects_minimum_length() {
        assert_eq!(admissible_range(50, 12), Some((11, 38)));
        assert_eq!(admissible_range(23, 12), Some((11, 11)));
        assert_eq!(admissible_range(22, 12), None);
    }

    #[test]
    fn suppression_keeps_strongest() {
        let c = vec![
            TransitionCandidate::new(10, 1.0, 1.0),
            TransitionCandidate::new(12, 3.0, 1.0),
            TransitionCandidate::new(30, 2.0, 1.0),
        ];
        let kept = suppress_nearby(c, 5);
        let idx: Vec<usize> = kept.iter().map(|c| c.index).collect();
        assert_eq!(idx, vec![12, 30]);
    }
}
