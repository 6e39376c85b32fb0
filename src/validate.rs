//! Segment validation, merging and whole-profile error metrics.
//!
//! Passes, in order:
//! 1. unfit segments are absorbed into a neighbour (a frustum neighbour is
//!    preferred, otherwise the longer one) and the union is re-fitted;
//! 2. low-variance merges: an adjacent pair whose union is explained by one
//!    shape about as well as by two (`merged ≤ (1 + variance_threshold) ×
//!    pooled` RMS) is merged, provided the merged shape is the same as or
//!    more general than the absorbed one;
//! 3. parameter continuity: adjacent cylinders with nearly equal radii,
//!    frustums that continue each other's taper and cones with similar base
//!    radii are merged when the joint fit stays close to the separate fits.
//!
//! Sphere caps are never merged with anything but unfit segments. The
//! result keeps the partition invariant: contiguous segments sharing their
//! boundary samples and covering the whole profile.

use crate::shapes::{classify_and_fit, Primitive, SegmentClassification, ShapeParams};
use crate::signal::AreaProfile;
use crate::types::{Confidence, DetectionMethod, Segment, SegmentCount, SegmentationResult, ShapeKind};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationParams {
    /// Relative RMS increase tolerated when merging two segments.
    pub variance_threshold: f64,
    /// Merged fits below this relative error are always accepted.
    pub exact_fit_tolerance: f64,
    /// Relative radius difference for merging adjacent cylinders.
    pub cylinder_radius_tolerance: f64,
    /// Relative radius mismatch for merging frustums and cones.
    pub taper_tolerance: f64,
    /// Continuity merges accept a joint error up to this multiple of the
    /// worse separate error.
    pub continuity_error_ratio: f64,
    /// Simpson intervals per segment for volume integration (even).
    pub integration_intervals: usize,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            variance_threshold: 0.14,
            exact_fit_tolerance: 1e-6,
            cylinder_radius_tolerance: 0.05,
            taper_tolerance: 0.10,
            continuity_error_ratio: 1.2,
            integration_intervals: 64,
        }
    }
}

/// Reason two segments were joined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeReason {
    AbsorbedUnfit,
    LowVariance,
    Continuity,
}

/// One merge performed by the validator.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeAction {
    pub reason: MergeReason,
    pub left: (usize, usize),
    pub right: (usize, usize),
    pub merged_shape: ShapeKind,
    /// Merged RMS over pooled RMS of the two parts.
    pub rms_ratio: f64,
}

/// Detector-level facts carried into the result.
#[derive(Clone, Copy, Debug)]
pub struct ResultContext {
    pub predicted_count: SegmentCount,
    pub count_confidence: Confidence,
    pub detection_method: DetectionMethod,
    pub low_confidence: bool,
}

/// Merge, re-fit and score the classified segments.
pub fn validate_and_merge(
    profile: &AreaProfile,
    classified: Vec<SegmentClassification>,
    context: ResultContext,
    shape_params: &ShapeParams,
    params: &ValidationParams,
) -> (SegmentationResult, Vec<MergeAction>) {
    let mut pieces = classified;
    let mut actions = Vec::new();

    absorb_unfit(profile, &mut pieces, shape_params, &mut actions);
    merge_low_variance(profile, &mut pieces, shape_params, params, &mut actions);
    merge_continuous(profile, &mut pieces, shape_params, params, &mut actions);

    let segments: Vec<Segment> = pieces.into_iter().map(|p| p.segment).collect();
    let reconstruction_error = reconstruction_error(profile, &segments, params.integration_intervals);
    let curve_rms_error = curve_rms_error(profile, &segments);

    let low_confidence = context.low_confidence
        || (segments.len() == 1 && segments[0].kind() == ShapeKind::Unfit);
    let mean_confidence = if segments.is_empty() {
        0.0
    } else {
        segments.iter().map(|s| s.confidence).sum::<f64>() / segments.len() as f64
    };
    let volume_factor = if reconstruction_error.is_finite() {
        1.0 - (10.0 * reconstruction_error).min(1.0)
    } else {
        0.0
    };
    let mut processing_confidence = (mean_confidence * volume_factor).clamp(0.0, 1.0);
    if low_confidence {
        processing_confidence = processing_confidence.min(0.3);
    }
    debug!(
        "validate_and_merge: segments={} merges={} recon={:.4} curve_rms={:.5} confidence={:.3}",
        segments.len(),
        actions.len(),
        reconstruction_error,
        curve_rms_error,
        processing_confidence
    );

    (
        SegmentationResult {
            segments,
            reconstruction_error,
            curve_rms_error,
            processing_confidence,
            low_confidence,
            predicted_count: context.predicted_count,
            count_confidence: context.count_confidence,
            detection_method: context.detection_method,
        },
        actions,
    )
}

fn pooled_rms(a: &SegmentClassification, b: &SegmentClassification) -> f64 {
    let (na, nb) = (a.segment.len() as f64, b.segment.len() as f64);
    ((na * a.rms * a.rms + nb * b.rms * b.rms) / (na + nb)).sqrt()
}

fn merge_pair(
    profile: &AreaProfile,
    pieces: &[SegmentClassification],
    i: usize,
    shape_params: &ShapeParams,
) -> SegmentClassification {
    classify_and_fit(
        profile,
        pieces[i].segment.start_index,
        pieces[i + 1].segment.end_index,
        shape_params,
    )
}

fn record(
    actions: &mut Vec<MergeAction>,
    reason: MergeReason,
    left: &Segment,
    right: &Segment,
    merged: &SegmentClassification,
    rms_ratio: f64,
) {
    debug!(
        "validate_and_merge: {:?} [{}, {}] + [{}, {}] -> {:?}",
        reason,
        left.start_index,
        left.end_index,
        right.start_index,
        right.end_index,
        merged.segment.kind()
    );
    actions.push(MergeAction {
        reason,
        left: (left.start_index, left.end_index),
        right: (right.start_index, right.end_index),
        merged_shape: merged.segment.kind(),
        rms_ratio,
    });
}

fn absorb_unfit(
    profile: &AreaProfile,
    pieces: &mut Vec<SegmentClassification>,
    shape_params: &ShapeParams,
    actions: &mut Vec<MergeAction>,
) {
    while pieces.len() > 1 {
        let Some(i) = pieces.iter().position(|p| p.segment.kind() == ShapeKind::Unfit) else {
            return;
        };
        let left = i.checked_sub(1);
        let right = (i + 1 < pieces.len()).then_some(i + 1);
        let neighbour = match (left, right) {
            (Some(l), Some(r)) => {
                let score = |k: usize| {
                    let seg = &pieces[k].segment;
                    (seg.kind() == ShapeKind::Frustum, seg.kind() != ShapeKind::Unfit, seg.len())
                };
                if score(r) > score(l) {
                    r
                } else {
                    l
                }
            }
            (Some(l), None) => l,
            (None, Some(r)) => r,
            (None, None) => return,
        };
        let first = i.min(neighbour);
        let merged = merge_pair(profile, pieces, first, shape_params);
        warn!(
            "validate_and_merge: unfit segment [{}, {}] absorbed",
            pieces[i].segment.start_index, pieces[i].segment.end_index
        );
        record(
            actions,
            MergeReason::AbsorbedUnfit,
            &pieces[first].segment,
            &pieces[first + 1].segment,
            &merged,
            f64::NAN,
        );
        pieces.splice(first..first + 2, std::iter::once(merged));
    }
}

/// The merged shape must cover both parts, and one part must already cover
/// the other.
fn merge_allowed(a: ShapeKind, b: ShapeKind, merged: ShapeKind) -> bool {
    if a == ShapeKind::SphereCap || b == ShapeKind::SphereCap {
        return false;
    }
    (a.generalizes(b) || b.generalizes(a)) && merged.generalizes(a) && merged.generalizes(b)
}

fn merge_low_variance(
    profile: &AreaProfile,
    pieces: &mut Vec<SegmentClassification>,
    shape_params: &ShapeParams,
    params: &ValidationParams,
    actions: &mut Vec<MergeAction>,
) {
    loop {
        let mut best: Option<(usize, f64, SegmentClassification)> = None;
        for i in 0..pieces.len().saturating_sub(1) {
            let (a, b) = (&pieces[i], &pieces[i + 1]);
            if a.segment.kind() == ShapeKind::SphereCap || b.segment.kind() == ShapeKind::SphereCap {
                continue;
            }
            let merged = merge_pair(profile, pieces, i, shape_params);
            if !merge_allowed(a.segment.kind(), b.segment.kind(), merged.segment.kind()) {
                continue;
            }
            let pooled = pooled_rms(a, b);
            let ratio = if pooled > 0.0 {
                merged.rms / pooled
            } else if merged.rms > 0.0 {
                f64::INFINITY
            } else {
                1.0
            };
            let accept = ratio <= 1.0 + params.variance_threshold
                || merged.segment.fit_error <= params.exact_fit_tolerance;
            if accept && best.as_ref().map_or(true, |(_, r, _)| ratio < *r) {
                best = Some((i, ratio, merged));
            }
        }
        let Some((i, ratio, merged)) = best else {
            return;
        };
        record(
            actions,
            MergeReason::LowVariance,
            &pieces[i].segment,
            &pieces[i + 1].segment,
            &merged,
            ratio,
        );
        pieces.splice(i..i + 2, std::iter::once(merged));
    }
}

fn relative_gap(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale > 0.0 {
        (a - b).abs() / scale
    } else {
        0.0
    }
}

/// Whether two same-kind neighbours continue each other's parameters.
fn parameters_continue(a: &Primitive, b: &Primitive, params: &ValidationParams) -> bool {
    match (*a, *b) {
        (Primitive::Cylinder { radius: ra, .. }, Primitive::Cylinder { radius: rb, .. }) => {
            relative_gap(ra, rb) < params.cylinder_radius_tolerance
        }
        (
            Primitive::Frustum {
                bottom_radius: a1,
                top_radius: a2,
                ..
            },
            Primitive::Frustum {
                bottom_radius: b1,
                top_radius: b2,
                ..
            },
        ) => {
            let same_taper = (a2 - a1).signum() == (b2 - b1).signum();
            same_taper && relative_gap(a2, b1) < params.taper_tolerance
        }
        (Primitive::Cone { base_radius: ra, .. }, Primitive::Cone { base_radius: rb, .. }) => {
            relative_gap(ra, rb) < params.taper_tolerance
        }
        _ => false,
    }
}

fn merge_continuous(
    profile: &AreaProfile,
    pieces: &mut Vec<SegmentClassification>,
    shape_params: &ShapeParams,
    params: &ValidationParams,
    actions: &mut Vec<MergeAction>,
) {
    let mut i = 0;
    while i + 1 < pieces.len() {
        let (a, b) = (&pieces[i], &pieces[i + 1]);
        let same_kind = a.segment.kind() == b.segment.kind();
        if !same_kind
            || a.segment.kind() == ShapeKind::SphereCap
            || !parameters_continue(&a.segment.shape, &b.segment.shape, params)
        {
            i += 1;
            continue;
        }
        let merged = merge_pair(profile, pieces, i, shape_params);
        let worse = a.segment.fit_error.max(b.segment.fit_error);
        let pooled = pooled_rms(a, b);
        let ratio = if pooled > 0.0 { merged.rms / pooled } else { 1.0 };
        let accept = merged.segment.kind().generalizes(a.segment.kind())
            && (merged.segment.fit_error <= params.continuity_error_ratio * worse
                || merged.segment.fit_error <= params.exact_fit_tolerance);
        if accept {
            record(
                actions,
                MergeReason::Continuity,
                &pieces[i].segment,
                &pieces[i + 1].segment,
                &merged,
                ratio,
            );
            pieces.splice(i..i + 2, std::iter::once(merged));
        } else {
            i += 1;
        }
    }
}

/// Integrated volume of the fitted primitives, `∫ π r(h)² dh` per segment
/// (composite Simpson).
pub fn profile_volume(segments: &[Segment]) -> f64 {
    integrate_segments(segments, ValidationParams::default().integration_intervals)
}

fn integrate_segments(segments: &[Segment], intervals: usize) -> f64 {
    let m = (intervals.max(2) + 1) / 2 * 2;
    segments
        .iter()
        .map(|s| {
            let length = s.height_span();
            if length <= 0.0 {
                return 0.0;
            }
            let step = length / m as f64;
            let sum: f64 = (0..=m)
                .map(|k| {
                    let w = if k == 0 || k == m {
                        1.0
                    } else if k % 2 == 1 {
                        4.0
                    } else {
                        2.0
                    };
                    w * s.shape.area_at(k as f64 * step)
                })
                .sum();
            sum * step / 3.0
        })
        .sum()
}

/// `|∫ fitted − ΔV| / ΔV` over the whole profile.
pub fn reconstruction_error(profile: &AreaProfile, segments: &[Segment], intervals: usize) -> f64 {
    let measured = profile.volume_span();
    let fitted = integrate_segments(segments, intervals);
    if measured.abs() <= f64::MIN_POSITIVE {
        return if fitted.abs() <= f64::MIN_POSITIVE {
            0.0
        } else {
            f64::INFINITY
        };
    }
    (fitted - measured).abs() / measured.abs()
}

/// RMS deviation of the piecewise reconstructed volume curve from the
/// samples, relative to the measured volume span.
pub fn curve_rms_error(profile: &AreaProfile, segments: &[Segment]) -> f64 {
    let n = profile.len();
    let span = profile.volume_span().abs();
    if n == 0 || segments.is_empty() || span <= f64::MIN_POSITIVE {
        return 0.0;
    }
    let mut base = profile.volumes[0];
    let mut sum_sq = 0.0;
    let mut seg_iter = segments.iter();
    let mut current = seg_iter.next();
    for i in 0..n {
        while let Some(seg) = current {
            if i <= seg.end_index {
                break;
            }
            base += seg.fitted_volume();
            current = seg_iter.next();
        }
        let Some(seg) = current else { break };
        let t = profile.heights[i] - seg.start_height;
        let predicted = base + seg.shape.volume_at(t);
        sum_sq += (predicted - profile.volumes[i]).powi(2);
    }
    (sum_sq / n as f64).sqrt() / span
}
