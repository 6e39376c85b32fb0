//! Shape selection for one segment.
//!
//! All four primitives are fitted. Their raw errors are then adjusted by a
//! curvature discriminator that separates the two most confused shapes,
//! cylinder and sphere cap:
//! - a confident sphere-cap signature lowers the sphere-cap error by
//!   `sphere_cap_bonus × confidence`;
//! - a curved segment with a weak cylinder signature raises the cylinder
//!   error by up to `cylinder_penalty`.
//!
//! The lowest adjusted error wins; errors within `tie_tolerance` go to the
//! simpler shape. A winning frustum that is really a cylinder (equal radii)
//! or a cone (one radius near zero) collapses to that shape when its fit is
//! about as good.

use super::fit::{fit_shape, FittingParams, SegmentData, ShapeFit};
use super::{Primitive, ShapeParams};
use crate::signal::filters::{gaussian_smooth, gradient, mean, std_dev};
use crate::signal::AreaProfile;
use crate::types::{Segment, ShapeKind};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Discriminator and adjustment knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierParams {
    /// Curvature index above which a weak cylinder is penalised.
    pub curvature_threshold: f64,
    pub sphere_cap_bonus: f64,
    pub cylinder_penalty: f64,
    /// Sphere-cap confidence needed before the bonus applies; the cylinder
    /// penalty applies below the same level of cylinder confidence.
    pub confidence_gate: f64,
    /// Radius coefficient of variation treated as clearly non-cylindrical.
    pub radius_cv_scale: f64,
    /// Sigma (samples) of the smoothing applied before the discriminator.
    pub smoothing_sigma: f64,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            curvature_threshold: 0.10,
            sphere_cap_bonus: 0.3,
            cylinder_penalty: 0.5,
            confidence_gate: 0.5,
            radius_cv_scale: 0.05,
            smoothing_sigma: 1.0,
        }
    }
}

/// Features of the radius profile used to weigh the fits.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeEvidence {
    pub radius_cv: f64,
    /// Segment height times mean wall curvature.
    pub curvature_index: f64,
    /// R² of a Gaussian fitted to `|dr/dh|`; zero when not Gaussian-shaped.
    pub gaussian_r2: f64,
    /// `|dr/dh|` falls off along the segment.
    pub decaying_slope: bool,
    /// The radius trend keeps one direction.
    pub monotonic: bool,
    pub sphere_cap_confidence: f64,
    pub cylinder_confidence: f64,
}

/// One row of the per-segment comparison.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeCandidate {
    pub kind: ShapeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fit: Option<ShapeFit>,
    /// Raw error in percent; infinite for failed fits.
    pub error_percent: f64,
    pub adjusted_error: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Fitted segment plus the evidence behind the choice.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentClassification {
    pub segment: Segment,
    pub evidence: ShapeEvidence,
    pub candidates: Vec<ShapeCandidate>,
    /// RMS volume residual of the chosen fit.
    pub rms: f64,
}

/// Compute discriminator features from the raw area of a segment.
pub fn discriminate(t: &[f64], raw_area: &[f64], params: &ClassifierParams) -> ShapeEvidence {
    let n = t.len();
    if n < 3 || raw_area.len() != n {
        return ShapeEvidence::default();
    }
    let length = t[n - 1] - t[0];
    let area = gaussian_smooth(raw_area, params.smoothing_sigma).unwrap_or_else(|_| raw_area.to_vec());
    let radius: Vec<f64> = area.iter().map(|a| (a.max(0.0) / PI).sqrt()).collect();

    let mean_r = mean(&radius);
    let radius_cv = if mean_r > f64::EPSILON {
        std_dev(&radius) / mean_r
    } else {
        0.0
    };

    let dr = gradient(&radius, t);
    let d2r = gradient(&dr, t);
    let wall_curvature: Vec<f64> = dr
        .iter()
        .zip(&d2r)
        .map(|(d1, d2)| d2.abs() / (1.0 + d1 * d1).powf(1.5))
        .collect();
    let curvature_index = mean(&wall_curvature) * length;

    let slope: Vec<f64> = dr.iter().map(|v| v.abs()).collect();
    let peak_slope = slope.iter().fold(0.0f64, |m, v| m.max(*v));
    let tiny = 1e-9 * peak_slope.max(f64::MIN_POSITIVE);
    let rising = dr.iter().filter(|v| **v > tiny).count();
    let falling = dr.iter().filter(|v| **v < -tiny).count();
    let monotonic = rising.max(falling) as f64 >= 0.9 * n as f64;

    let quarter = (n / 4).max(2).min(n);
    let head = mean(&slope[..quarter]);
    let tail = mean(&slope[n - quarter..]);
    let decaying_slope = head > tiny && tail / head < 0.6;

    let gaussian_r2 = gaussian_fit_r2(t, &slope, length);

    let curvature_score = (curvature_index / (4.0 * params.curvature_threshold)).clamp(0.0, 1.0);
    let sphere_cap_confidence = if decaying_slope && monotonic {
        0.5 * gaussian_r2 + 0.5 * curvature_score
    } else {
        0.0
    };
    let cylinder_confidence =
        (1.0 - (radius_cv / params.radius_cv_scale).clamp(0.0, 1.0)) * (1.0 - curvature_score);

    ShapeEvidence {
        radius_cv,
        curvature_index,
        gaussian_r2,
        decaying_slope,
        monotonic,
        sphere_cap_confidence,
        cylinder_confidence,
    }
}

/// R² of `exp(c0 + c1 t + c2 t²)` fitted to `values` in log space. Only a
/// concave log-quadratic (a true Gaussian) narrower than twice the segment
/// counts; anything else scores zero.
fn gaussian_fit_r2(t: &[f64], values: &[f64], length: f64) -> f64 {
    let peak = values.iter().fold(0.0f64, |m, v| m.max(*v));
    if peak <= 0.0 || length <= 0.0 {
        return 0.0;
    }
    let points: Vec<(f64, f64)> = t
        .iter()
        .zip(values)
        .filter(|(_, v)| **v > 1e-6 * peak)
        .map(|(&x, &v)| (x, v))
        .collect();
    if points.len() < 5 {
        return 0.0;
    }
    let x0 = 0.5 * (points[0].0 + points[points.len() - 1].0);
    let half = 0.5 * (points[points.len() - 1].0 - points[0].0);
    let s = if half > 0.0 { half } else { 1.0 };

    let design = DMatrix::from_fn(points.len(), 3, |i, j| ((points[i].0 - x0) / s).powi(j as i32));
    let target = DVector::from_iterator(points.len(), points.iter().map(|(_, v)| v.ln()));
    let Ok(coeffs) = design.clone().svd(true, true).solve(&target, 1e-12) else {
        return 0.0;
    };
    if coeffs[2] >= 0.0 {
        return 0.0;
    }
    let sigma = (-1.0 / (2.0 * coeffs[2])).sqrt() * s;
    if !(sigma.is_finite() && sigma < 2.0 * length) {
        return 0.0;
    }

    let predicted = &design * &coeffs;
    let observed: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    let m = mean(&observed);
    let ss_tot: f64 = observed.iter().map(|v| (v - m).powi(2)).sum();
    if ss_tot <= 1e-12 * m * m * observed.len() as f64 {
        return 0.0;
    }
    let ss_res: f64 = observed
        .iter()
        .zip(predicted.iter())
        .map(|(o, p)| (o - p.exp()).powi(2))
        .sum();
    (1.0 - ss_res / ss_tot).max(0.0)
}

/// Fit all primitives to samples `start..=end` and pick the segment shape.
pub fn classify_and_fit(
    profile: &AreaProfile,
    start: usize,
    end: usize,
    params: &ShapeParams,
) -> SegmentClassification {
    let data = SegmentData::new(
        &profile.heights[start..=end],
        &profile.volumes[start..=end],
        &profile.raw_area[start..=end],
    );
    let evidence = discriminate(&data.t, &data.raw_area, &params.classifier);
    let mut candidates: Vec<ShapeCandidate> = ShapeKind::CANDIDATES
        .iter()
        .map(|&kind| match fit_shape(kind, &data, &params.fitting) {
            Ok(fit) => ShapeCandidate {
                kind,
                error_percent: fit.error_percent(),
                adjusted_error: fit.error_percent(),
                fit: Some(fit),
                failure: None,
            },
            Err(err) => {
                debug!("classify_and_fit: [{start}, {end}] {err}");
                ShapeCandidate {
                    kind,
                    fit: None,
                    error_percent: f64::INFINITY,
                    adjusted_error: f64::INFINITY,
                    failure: Some(err.to_string()),
                }
            }
        })
        .collect();
    apply_adjustments(&mut candidates, &evidence, &params.classifier);

    let start_height = profile.heights[start];
    let end_height = profile.heights[end];
    let Some(chosen) = select(&candidates, &params.fitting) else {
        warn!("classify_and_fit: every fit failed for [{start}, {end}], segment left unfit");
        return SegmentClassification {
            segment: Segment {
                start_index: start,
                end_index: end,
                start_height,
                end_height,
                shape: Primitive::Unfit {
                    height: end_height - start_height,
                },
                fit_error: f64::INFINITY,
                confidence: 0.0,
            },
            evidence,
            candidates,
            rms: f64::INFINITY,
        };
    };

    let confidence = segment_confidence(&candidates, chosen);
    let fit = candidates[chosen].fit.clone();
    let (shape, fit_error, rms) = match fit {
        Some(f) => (f.primitive, f.fit_error, f.rms),
        None => (
            Primitive::Unfit {
                height: end_height - start_height,
            },
            f64::INFINITY,
            f64::INFINITY,
        ),
    };
    debug!(
        "classify_and_fit: [{start}, {end}] -> {:?} err={:.4}% conf={:.3}",
        shape.kind(),
        fit_error * 100.0,
        confidence
    );
    SegmentClassification {
        segment: Segment {
            start_index: start,
            end_index: end,
            start_height,
            end_height,
            shape,
            fit_error,
            confidence,
        },
        evidence,
        candidates,
        rms,
    }
}

fn apply_adjustments(
    candidates: &mut [ShapeCandidate],
    evidence: &ShapeEvidence,
    params: &ClassifierParams,
) {
    for c in candidates.iter_mut().filter(|c| c.fit.is_some()) {
        match c.kind {
            ShapeKind::SphereCap if evidence.sphere_cap_confidence > params.confidence_gate => {
                c.adjusted_error -= params.sphere_cap_bonus * evidence.sphere_cap_confidence;
            }
            ShapeKind::Cylinder
                if evidence.curvature_index > params.curvature_threshold
                    && evidence.cylinder_confidence < params.confidence_gate =>
            {
                c.adjusted_error += params.cylinder_penalty * (1.0 - evidence.cylinder_confidence);
            }
            _ => {}
        }
    }
}

/// Index of the chosen candidate, `None` when every fit failed.
fn select(candidates: &[ShapeCandidate], params: &FittingParams) -> Option<usize> {
    let best = candidates
        .iter()
        .filter(|c| c.fit.is_some())
        .map(|c| c.adjusted_error)
        .fold(f64::INFINITY, f64::min);
    if !best.is_finite() {
        return None;
    }
    let mut chosen = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.fit.is_some() && c.adjusted_error <= best + params.tie_tolerance)
        .min_by_key(|(_, c)| c.kind.simplicity_rank())
        .map(|(i, _)| i)?;

    if let Some(Primitive::Frustum {
        bottom_radius,
        top_radius,
        ..
    }) = candidates[chosen].fit.as_ref().map(|f| f.primitive)
    {
        let frustum_error = candidates[chosen].error_percent;
        let close_enough = |kind: ShapeKind| -> Option<usize> {
            candidates.iter().position(|c| {
                c.kind == kind
                    && c.fit.is_some()
                    && (c.error_percent <= params.collapse_ratio * frustum_error
                        || c.error_percent <= frustum_error + params.tie_tolerance)
            })
        };
        let wide = bottom_radius.max(top_radius);
        if wide > 0.0 && (top_radius - bottom_radius).abs() / wide < params.degenerate_radius_ratio {
            if let Some(i) = close_enough(ShapeKind::Cylinder) {
                chosen = i;
            }
        } else if bottom_radius < top_radius && bottom_radius / top_radius < params.degenerate_radius_ratio {
            if let Some(i) = close_enough(ShapeKind::Cone) {
                chosen = i;
            }
        }
    }
    Some(chosen)
}

/// Fit quality scaled by the margin to the nearest distinct alternative.
fn segment_confidence(candidates: &[ShapeCandidate], chosen: usize) -> f64 {
    let pick = &candidates[chosen];
    let quality = 1.0 / (1.0 + pick.error_percent.max(0.0));
    let runner_up = candidates
        .iter()
        .filter(|c| {
            c.fit.is_some()
                && c.kind != pick.kind
                && !c.kind.generalizes(pick.kind)
                && !pick.kind.generalizes(c.kind)
        })
        .map(|c| c.adjusted_error)
        .fold(f64::INFINITY, f64::min);
    let margin = (runner_up - pick.adjusted_error).max(0.0);
    let margin_score = if margin.is_finite() {
        margin / (margin + 0.5)
    } else {
        1.0
    };
    (quality * (0.6 + 0.4 * margin_score)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::raw_area;

    fn profile_of(primitive: Primitive, n: usize) -> AreaProfile {
        let height = primitive.height();
        let heights: Vec<f64> = (0..n).map(|i| height * i as f64 / (n - 1) as f64).collect();
        let volumes: Vec<f64> = heights.iter().map(|&t| primitive.volume_at(t)).collect();
        let raw = raw_area(&heights, &volumes, 1e-9);
        AreaProfile {
            heights,
            volumes,
            area: raw.clone(),
            raw_area: raw,
        }
    }

    fn classify(primitive: Primitive) -> SegmentClassification {
        let profile = profile_of(primitive, 50);
        classify_and_fit(&profile, 0, 49, &ShapeParams::default())
    }

    #[test]
    fn cylinder_wins_ties_with_frustum() {
        let out = classify(Primitive::Cylinder {
            radius: 5.0,
            height: 50.0,
        });
        assert_eq!(out.segment.kind(), ShapeKind::Cylinder);
        assert!(out.segment.confidence > 0.5);
    }

    #[test]
    fn degenerate_frustum_collapses_to_cone() {
        let out = classify(Primitive::Cone {
            base_radius: 5.0,
            height: 20.0,
        });
        assert_eq!(out.segment.kind(), ShapeKind::Cone, "{:?}", out.candidates);
    }

    #[test]
    fn sphere_cap_is_recognised() {
        let out = classify(Primitive::SphereCap {
            sphere_radius: 12.0,
            cap_height: 10.0,
        });
        assert_eq!(out.segment.kind(), ShapeKind::SphereCap, "{:?}", out.candidates);
        assert!(out.evidence.sphere_cap_confidence > 0.5, "{:?}", out.evidence);
    }

    #[test]
    fn frustum_is_kept_when_radii_differ() {
        let out = classify(Primitive::Frustum {
            bottom_radius: 5.0,
            top_radius: 10.0,
            height: 40.0,
        });
        assert_eq!(out.segment.kind(), ShapeKind::Frustum);
    }

    #[test]
    fn discriminator_scores_cylinder() {
        let t: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let area = vec![PI * 16.0; 40];
        let ev = discriminate(&t, &area, &ClassifierParams::default());
        assert!(ev.radius_cv < 1e-12);
        assert!(ev.cylinder_confidence > 0.99);
        assert_eq!(ev.sphere_cap_confidence, 0.0);
    }

    #[test]
    fn short_segments_are_unfit() {
        let profile = profile_of(
            Primitive::Cylinder {
                radius: 1.0,
                height: 3.0,
            },
            3,
        );
        let out = classify_and_fit(&profile, 0, 2, &ShapeParams::default());
        assert_eq!(out.segment.kind(), ShapeKind::Unfit);
        assert!(out.segment.fit_error.is_infinite());
        assert!(out.candidates.iter().all(|c| c.failure.is_some()));
    }
}
