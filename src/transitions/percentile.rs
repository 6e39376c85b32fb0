//! Percentile-peak strategy.
//!
//! Scores every sample by `w1 * |Δ(dA/dh)| + w2 * |d²A/dh²|` (each term
//! normalised by its maximum), smooths the score and keeps local maxima above
//! a percentile of the admissible region. Peaks closer than the merge
//! distance collapse into the strongest one.

use super::{admissible_range, suppress_nearby, CandidateSet, DetectionParams, TransitionCandidate};
use crate::derivatives::Derivatives;
use crate::signal::filters::{gaussian_smooth, percentile};
use log::debug;

/// Combined first/second derivative score, smoothed.
pub fn combined_score(derivatives: &Derivatives, params: &DetectionParams) -> Vec<f64> {
    let n = derivatives.first.len();
    let mut delta_first = vec![0.0; n];
    for i in 1..n {
        delta_first[i] = (derivatives.first[i] - derivatives.first[i - 1]).abs();
    }
    let second: Vec<f64> = derivatives.second.iter().map(|v| v.abs()).collect();
    let d1_max = delta_first.iter().fold(0.0f64, |m, v| m.max(*v));
    let d2_max = second.iter().fold(0.0f64, |m, v| m.max(*v));

    let raw: Vec<f64> = (0..n)
        .map(|i| {
            let a = if d1_max > 0.0 { delta_first[i] / d1_max } else { 0.0 };
            let b = if d2_max > 0.0 { second[i] / d2_max } else { 0.0 };
            params.first_weight * a + params.second_weight * b
        })
        .collect();
    gaussian_smooth(&raw, params.score_sigma).unwrap_or(raw)
}

/// Candidates of the percentile-peak strategy at the given percentile.
pub fn percentile_candidates(
    derivatives: &Derivatives,
    detection_percentile: f64,
    params: &DetectionParams,
) -> CandidateSet {
    let score = combined_score(derivatives, params);
    let n = score.len();
    let Some((lo, hi)) = admissible_range(n, params.min_segment_points) else {
        return CandidateSet::empty(0.0);
    };
    let region = &score[lo..=hi];
    let threshold = percentile(region, detection_percentile);

    let mut peaks = Vec::new();
    for i in lo..=hi {
        let left = if i > lo { score[i - 1] } else { f64::NEG_INFINITY };
        let right = if i < hi { score[i + 1] } else { f64::NEG_INFINITY };
        if score[i] > threshold && score[i] >= left && score[i] >= right {
            peaks.push(TransitionCandidate::new(i, score[i], threshold));
        }
    }
    let merge_distance = params.merge_distance(n);
    let candidates = suppress_nearby(peaks, merge_distance);
    debug!(
        "percentile_candidates: p={:.1} threshold={:.4} candidates={:?}",
        detection_percentile,
        threshold,
        candidates.iter().map(|c| c.index).collect::<Vec<_>>()
    );
    CandidateSet {
        candidates,
        threshold,
    }
}
