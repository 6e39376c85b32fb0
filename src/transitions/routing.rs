//! Strategy routing and reconciliation.

use super::{DetectionParams, TransitionCandidate, TransitionMethod};
use crate::estimate::CountEstimate;
use crate::types::{Confidence, SegmentCount};
use serde::Serialize;

/// Which strategies run for one profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Route {
    Percentile,
    Stability,
    Both,
}

/// Pick the strategies for a count estimate.
///
/// - `legacy` always uses the percentile-peak strategy.
/// - Without selective detection the predicted count alone decides.
/// - With it, an estimate at or above `selective_confidence_threshold` is
///   trusted; below that an ambiguous count (2 or ≥3) runs both strategies
///   and anything else stays on the percentile-peak baseline.
pub fn choose_route(estimate: &CountEstimate, params: &DetectionParams) -> Route {
    if params.method == TransitionMethod::Legacy {
        return Route::Percentile;
    }
    let matched = match estimate.count {
        SegmentCount::ThreeOrMore => Route::Stability,
        SegmentCount::One | SegmentCount::Two => Route::Percentile,
    };
    if !params.use_selective_detection {
        return matched;
    }
    if estimate.confidence >= params.selective_confidence_threshold {
        return matched;
    }
    match estimate.count {
        SegmentCount::Two | SegmentCount::ThreeOrMore => Route::Both,
        SegmentCount::One => Route::Percentile,
    }
}

/// Keep percentile candidates confirmed by a stability candidate within
/// `tolerance` samples. Returns an empty list when nothing matches.
pub fn reconcile(
    percentile: &[TransitionCandidate],
    stability: &[TransitionCandidate],
    tolerance: usize,
) -> Vec<TransitionCandidate> {
    percentile
        .iter()
        .filter_map(|p| {
            let partner = stability
                .iter()
                .filter(|s| s.index.abs_diff(p.index) <= tolerance)
                .max_by(|a, b| a.confidence.cmp(&b.confidence))?;
            let confidence = p.confidence.max(partner.confidence).max(Confidence::Medium);
            Some(TransitionCandidate {
                index: p.index,
                score: p.score,
                confidence,
            })
        })
        .collect()
}
