//! Stability-jump strategy.
//!
//! Regime changes between shapes of different curvature character show up as
//! steps of the stability metric rather than peaks. The strategy compares the
//! mean of `S` in a window left of each sample with the window on its right
//! and keeps positions where that jump exceeds `stability_jump_sigma`
//! standard deviations of `dS`. Each jump must also separate regions of
//! clearly different curvature or, on nearly straight regions, clearly
//! different gradient.

use super::{admissible_range, suppress_nearby, CandidateSet, DetectionParams, TransitionCandidate};
use crate::derivatives::Derivatives;
use crate::signal::filters::{gaussian_smooth, mean, sample_gradient, std_dev};
use log::debug;

/// Normalised curvature above which sides are compared by curvature ratio.
const CURVATURE_LEVEL: f64 = 0.1;
const CURVATURE_RATIO: f64 = 1.5;
const GRADIENT_CHANGE: f64 = 0.2;

/// Candidates of the stability-jump strategy.
pub fn stability_candidates(derivatives: &Derivatives, params: &DetectionParams) -> CandidateSet {
    let n = derivatives.stability.len();
    let smoothed = gaussian_smooth(&derivatives.stability, params.score_sigma)
        .unwrap_or_else(|_| derivatives.stability.clone());
    let threshold = params.stability_jump_sigma * std_dev(&sample_gradient(&smoothed));
    let window = (params.min_segment_points / 2).max(3);

    let Some((region_lo, region_hi)) = admissible_range(n, params.min_segment_points) else {
        return CandidateSet::empty(threshold);
    };
    let lo = region_lo.max(window);
    let hi = region_hi.min(n.saturating_sub(window));
    if lo > hi || threshold <= 0.0 {
        return CandidateSet::empty(threshold);
    }

    let jumps: Vec<f64> = (lo..=hi)
        .map(|i| (mean(&smoothed[i..i + window]) - mean(&smoothed[i - window..i])).abs())
        .collect();
    let peak_s = smoothed.iter().fold(0.0f64, |m, v| m.max(*v));

    let mut found = Vec::new();
    for (k, &jump) in jumps.iter().enumerate() {
        let left = if k > 0 { jumps[k - 1] } else { f64::NEG_INFINITY };
        let right = jumps.get(k + 1).copied().unwrap_or(f64::NEG_INFINITY);
        if jump <= threshold || jump < left || jump < right {
            continue;
        }
        let i = lo + k;
        if separates_regimes(derivatives, &smoothed, peak_s, i, window) {
            found.push(TransitionCandidate::new(i, jump, threshold));
        }
    }
    let candidates = suppress_nearby(found, params.merge_distance(n));
    debug!(
        "stability_candidates: threshold={:.4} window={} candidates={:?}",
        threshold,
        window,
        candidates.iter().map(|c| c.index).collect::<Vec<_>>()
    );
    CandidateSet {
        candidates,
        threshold,
    }
}

/// Curvature-ratio test on the two sides of `i`, falling back to a
/// gradient-change test when both sides are nearly straight.
fn separates_regimes(
    derivatives: &Derivatives,
    smoothed: &[f64],
    peak_s: f64,
    i: usize,
    window: usize,
) -> bool {
    let scale = if peak_s > 0.0 { peak_s } else { 1.0 };
    let left_curv = mean(&smoothed[i - window..i]) / scale;
    let right_curv = mean(&smoothed[i..i + window]) / scale;
    if left_curv.max(right_curv) > CURVATURE_LEVEL {
        let ratio = left_curv.max(right_curv) / left_curv.min(right_curv).max(1e-12);
        return ratio > CURVATURE_RATIO;
    }
    let grad_abs = |range: std::ops::Range<usize>| {
        mean(
            &derivatives.first[range]
                .iter()
                .map(|v| v.abs())
                .collect::<Vec<_>>(),
        )
    };
    let left_grad = grad_abs(i - window..i);
    let right_grad = grad_abs(i..i + window);
    let reference = 0.5 * (left_grad + right_grad);
    reference > 0.0 && (left_grad - right_grad).abs() > GRADIENT_CHANGE * reference
}
