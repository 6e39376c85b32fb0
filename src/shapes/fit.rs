//! Bounded Levenberg–Marquardt fits of the primitive volume laws.
//!
//! Each primitive is fitted to `V(h) − V(h₀)` against `t = h − h₀` over the
//! segment. The vertical offset is projected out: residuals and Jacobian
//! columns are centred on their means, so a noisy first sample does not
//! bias the shape parameters. Parameters are clamped to a box around an
//! initial guess taken from the (smoothed) area profile after every step.

use super::Primitive;
use crate::error::{AnalysisError, Result};
use crate::signal::filters::{gaussian_smooth, median_in_place};
use crate::types::ShapeKind;
use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;
const MIN_FIT_POINTS: usize = 4;

/// Solver and selection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FittingParams {
    /// Maximum model evaluations per fit.
    pub max_evaluations: usize,
    pub use_cone_smoothing: bool,
    /// Sigma (samples) of the cone pre-fit smoothing.
    pub cone_smoothing_sigma: f64,
    /// Sigma (samples) of the light smoothing used for initial guesses.
    pub guess_smoothing_sigma: f64,
    /// Fit errors (percent) closer than this are treated as ties.
    pub tie_tolerance: f64,
    /// A frustum collapses to a simpler shape whose error is within this
    /// factor of its own.
    pub collapse_ratio: f64,
    /// Relative radius difference below which a frustum is degenerate.
    pub degenerate_radius_ratio: f64,
}

impl Default for FittingParams {
    fn default() -> Self {
        Self {
            max_evaluations: 4000,
            use_cone_smoothing: true,
            cone_smoothing_sigma: 1.0,
            guess_smoothing_sigma: 1.0,
            tie_tolerance: 0.05,
            collapse_ratio: 1.2,
            degenerate_radius_ratio: 0.05,
        }
    }
}

/// Samples of one segment, rebased to its first sample.
#[derive(Clone, Debug)]
pub struct SegmentData {
    /// Height above the segment start.
    pub t: Vec<f64>,
    /// Volume above the segment start.
    pub volume: Vec<f64>,
    /// Unfiltered area samples of the segment.
    pub raw_area: Vec<f64>,
}

impl SegmentData {
    pub fn new(heights: &[f64], volumes: &[f64], raw_area: &[f64]) -> Self {
        let h0 = heights.first().copied().unwrap_or(0.0);
        let v0 = volumes.first().copied().unwrap_or(0.0);
        Self {
            t: heights.iter().map(|h| h - h0).collect(),
            volume: volumes.iter().map(|v| v - v0).collect(),
            raw_area: raw_area.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }

    pub fn height(&self) -> f64 {
        self.t.last().copied().unwrap_or(0.0)
    }

    pub fn volume_span(&self) -> f64 {
        match (self.volume.first(), self.volume.last()) {
            (Some(a), Some(b)) => (b - a).abs(),
            _ => 0.0,
        }
    }
}

/// A converged fit.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeFit {
    pub primitive: Primitive,
    /// RMS volume residual.
    pub rms: f64,
    /// RMS residual relative to the segment volume span.
    pub fit_error: f64,
    pub evaluations: usize,
}

impl ShapeFit {
    pub fn kind(&self) -> ShapeKind {
        self.primitive.kind()
    }

    pub fn error_percent(&self) -> f64 {
        self.fit_error * 100.0
    }
}

/// Box constraints and starting point for one primitive.
struct Problem {
    start: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
}

/// Fit one primitive to the segment.
pub fn fit_shape(kind: ShapeKind, data: &SegmentData, params: &FittingParams) -> Result<ShapeFit> {
    if data.len() < MIN_FIT_POINTS {
        return Err(AnalysisError::fit_failure(
            kind,
            format!("{} samples, need {}", data.len(), MIN_FIT_POINTS),
        ));
    }
    let length = data.height();
    if !(length.is_finite() && length > 0.0) {
        return Err(AnalysisError::fit_failure(kind, "segment has no height"));
    }
    let problem = initial_problem(kind, data, params)?;
    let (p, cost, evaluations) = levenberg_marquardt(kind, &problem, data, length, params.max_evaluations)
        .ok_or_else(|| AnalysisError::fit_failure(kind, "solver produced no finite estimate"))?;

    let rms = (cost / data.len() as f64).sqrt();
    let span = data.volume_span().max(f64::MIN_POSITIVE);
    let primitive = to_primitive(kind, &p, length);
    if !rms.is_finite() {
        return Err(AnalysisError::fit_failure(kind, "non-finite residual"));
    }
    debug!(
        "fit_shape: {:?} params={:?} err={:.4}% evals={}",
        kind,
        p.as_slice(),
        100.0 * rms / span,
        evaluations
    );
    Ok(ShapeFit {
        primitive,
        rms,
        fit_error: rms / span,
        evaluations,
    })
}

fn initial_problem(kind: ShapeKind, data: &SegmentData, params: &FittingParams) -> Result<Problem> {
    let length = data.height();
    let smooth = |sigma: f64| -> Vec<f64> {
        gaussian_smooth(&data.raw_area, sigma)
            .unwrap_or_else(|_| data.raw_area.clone())
            .into_iter()
            .map(|a| a.max(0.0))
            .collect()
    };
    let area = smooth(params.guess_smoothing_sigma);
    let radius_of = |a: f64| (a.max(0.0) / PI).sqrt();
    let mut scratch = area.clone();
    let typical = radius_of(median_in_place(&mut scratch));
    let peak = radius_of(area.iter().fold(0.0f64, |m, a| m.max(*a)));

    let problem = match kind {
        ShapeKind::Cylinder => {
            let g = typical;
            Problem {
                start: vec![g],
                lower: vec![0.5 * g],
                upper: vec![3.0 * g],
            }
        }
        ShapeKind::Frustum => {
            let g1 = radius_of(area[0]);
            let g2 = radius_of(area[area.len() - 1]);
            let gm = g1.max(g2).max(typical);
            Problem {
                start: vec![g1, g2],
                lower: vec![0.0, 0.0],
                upper: vec![3.0 * gm, 3.0 * gm],
            }
        }
        ShapeKind::Cone => {
            let cone_area = if params.use_cone_smoothing {
                smooth(params.cone_smoothing_sigma)
            } else {
                data.raw_area.iter().map(|a| a.max(0.0)).collect()
            };
            let k0 = radius_of(cone_area[cone_area.len() - 1]) / length;
            Problem {
                start: vec![k0],
                lower: vec![0.1 * k0],
                upper: vec![5.0 * k0],
            }
        }
        ShapeKind::SphereCap => {
            let r0 = 1.5 * peak;
            let lower = (0.5 * r0).max(0.5 * length);
            Problem {
                start: vec![r0.max(lower)],
                lower: vec![lower],
                upper: vec![(10.0 * r0).max(lower)],
            }
        }
        ShapeKind::Unfit => {
            return Err(AnalysisError::fit_failure(kind, "not a fittable shape"));
        }
    };
    let scale = problem.upper.iter().fold(0.0f64, |m, v| m.max(*v));
    if !(scale.is_finite() && scale > 0.0) || problem.start.iter().any(|v| !v.is_finite()) {
        return Err(AnalysisError::fit_failure(kind, "no usable initial guess"));
    }
    Ok(problem)
}

/// Model volume and its parameter gradient at `t` for a segment of height
/// `length`.
fn model(kind: ShapeKind, p: &[f64], t: f64, length: f64, grad: &mut [f64]) -> f64 {
    match kind {
        ShapeKind::Cylinder => {
            let r = p[0];
            grad[0] = 2.0 * PI * r * t;
            PI * r * r * t
        }
        ShapeKind::Frustum => {
            let (r1, r2) = (p[0], p[1]);
            let d = r2 - r1;
            let l = length;
            grad[0] = PI
                * (2.0 * r1 * t + (r2 - 2.0 * r1) * t * t / l - 2.0 * d * t.powi(3) / (3.0 * l * l));
            grad[1] = PI * (r1 * t * t / l + 2.0 * d * t.powi(3) / (3.0 * l * l));
            PI * (r1 * r1 * t + r1 * d * t * t / l + d * d * t.powi(3) / (3.0 * l * l))
        }
        ShapeKind::Cone => {
            let k = p[0];
            grad[0] = 2.0 * PI * k * t.powi(3) / 3.0;
            PI * k * k * t.powi(3) / 3.0
        }
        ShapeKind::SphereCap => {
            let r = p[0];
            if t <= 2.0 * r {
                grad[0] = PI * t * t;
                PI * t * t * (3.0 * r - t) / 3.0
            } else {
                grad[0] = 4.0 * PI * r * r;
                4.0 / 3.0 * PI * r.powi(3)
            }
        }
        ShapeKind::Unfit => 0.0,
    }
}

fn to_primitive(kind: ShapeKind, p: &DVector<f64>, length: f64) -> Primitive {
    match kind {
        ShapeKind::Cylinder => Primitive::Cylinder {
            radius: p[0],
            height: length,
        },
        ShapeKind::Frustum => Primitive::Frustum {
            bottom_radius: p[0],
            top_radius: p[1],
            height: length,
        },
        ShapeKind::Cone => Primitive::Cone {
            base_radius: p[0] * length,
            height: length,
        },
        ShapeKind::SphereCap => Primitive::SphereCap {
            sphere_radius: p[0],
            cap_height: length,
        },
        ShapeKind::Unfit => Primitive::Unfit { height: length },
    }
}

/// Offset-free residuals and centred Jacobian at `p`.
fn evaluate(
    kind: ShapeKind,
    p: &DVector<f64>,
    data: &SegmentData,
    length: f64,
    centred_target: &[f64],
) -> (DVector<f64>, DMatrix<f64>) {
    let n = data.len();
    let k = p.len();
    let mut values = DVector::<f64>::zeros(n);
    let mut jac = DMatrix::<f64>::zeros(n, k);
    let mut grad = [0.0f64; 2];
    for (i, &t) in data.t.iter().enumerate() {
        values[i] = model(kind, p.as_slice(), t, length, &mut grad);
        for j in 0..k {
            jac[(i, j)] = grad[j];
        }
    }
    let mean_value = values.mean();
    let mut residual = DVector::<f64>::zeros(n);
    for i in 0..n {
        residual[i] = centred_target[i] - (values[i] - mean_value);
    }
    for j in 0..k {
        let col_mean = jac.column(j).mean();
        for i in 0..n {
            jac[(i, j)] -= col_mean;
        }
    }
    (residual, jac)
}

fn project(p: &mut DVector<f64>, problem: &Problem) {
    for (j, v) in p.iter_mut().enumerate() {
        *v = v.clamp(problem.lower[j], problem.upper[j]);
    }
}

/// Marquardt-damped Gauss–Newton with projection onto the parameter box.
/// Returns parameters, residual sum of squares and model evaluations.
fn levenberg_marquardt(
    kind: ShapeKind,
    problem: &Problem,
    data: &SegmentData,
    length: f64,
    max_evaluations: usize,
) -> Option<(DVector<f64>, f64, usize)> {
    let n = data.len() as f64;
    let target_mean = data.volume.iter().sum::<f64>() / n;
    let centred: Vec<f64> = data.volume.iter().map(|v| v - target_mean).collect();

    let mut p = DVector::from_vec(problem.start.clone());
    project(&mut p, problem);
    let (mut residual, mut jac) = evaluate(kind, &p, data, length, &centred);
    let mut cost = residual.norm_squared();
    let mut evaluations = 1usize;
    let mut lambda = LAMBDA_INIT;

    while evaluations < max_evaluations {
        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &residual;
        let floor = 1e-12 * jtj.trace().abs().max(f64::MIN_POSITIVE);

        let mut improved = false;
        let mut step_size = 0.0;
        while lambda < LAMBDA_MAX && evaluations < max_evaluations {
            let mut damped = jtj.clone();
            for j in 0..damped.nrows() {
                damped[(j, j)] += lambda * jtj[(j, j)].max(floor);
            }
            let Some(delta) = damped.lu().solve(&jtr) else {
                lambda *= 10.0;
                continue;
            };
            let mut candidate = &p + &delta;
            project(&mut candidate, problem);
            let (r_new, j_new) = evaluate(kind, &candidate, data, length, &centred);
            evaluations += 1;
            let c_new = r_new.norm_squared();
            if c_new.is_finite() && c_new < cost {
                step_size = (&candidate - &p)
                    .iter()
                    .zip(p.iter())
                    .map(|(d, v)| d.abs() / (v.abs() + 1e-12))
                    .fold(0.0f64, f64::max);
                p = candidate;
                residual = r_new;
                jac = j_new;
                cost = c_new;
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                improved = true;
                break;
            }
            lambda *= 10.0;
        }
        if !improved || step_size < 1e-12 || cost <= f64::MIN_POSITIVE {
            break;
        }
    }

    (cost.is_finite() && p.iter().all(|v| v.is_finite())).then_some((p, cost, evaluations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::raw_area;

    fn data_for(primitive: Primitive, n: usize) -> SegmentData {
        let height = primitive.height();
        let heights: Vec<f64> = (0..n).map(|i| height * i as f64 / (n - 1) as f64).collect();
        let volumes: Vec<f64> = heights.iter().map(|&t| primitive.volume_at(t)).collect();
        let area = raw_area(&heights, &volumes, 1e-9);
        SegmentData::new(&heights, &volumes, &area)
    }

    #[test]
    fn recovers_cylinder_radius() {
        let data = data_for(
            Primitive::Cylinder {
                radius: 5.0,
                height: 50.0,
            },
            50,
        );
        let fit = fit_shape(ShapeKind::Cylinder, &data, &FittingParams::default()).unwrap();
        match fit.primitive {
            Primitive::Cylinder { radius, .. } => assert!((radius - 5.0).abs() < 1e-6, "{radius}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(fit.fit_error < 1e-8);
    }

    #[test]
    fn recovers_frustum_radii() {
        let data = data_for(
            Primitive::Frustum {
                bottom_radius: 5.0,
                top_radius: 10.0,
                height: 40.0,
            },
            50,
        );
        let fit = fit_shape(ShapeKind::Frustum, &data, &FittingParams::default()).unwrap();
        let Primitive::Frustum {
            bottom_radius,
            top_radius,
            ..
        } = fit.primitive
        else {
            panic!("expected frustum");
        };
        assert!((bottom_radius - 5.0).abs() < 1e-4, "{bottom_radius}");
        assert!((top_radius - 10.0).abs() < 1e-4, "{top_radius}");
    }

    #[test]
    fn recovers_sphere_cap_radius() {
        let data = data_for(
            Primitive::SphereCap {
                sphere_radius: 12.0,
                cap_height: 10.0,
            },
            50,
        );
        let fit = fit_shape(ShapeKind::SphereCap, &data, &FittingParams::default()).unwrap();
        let Primitive::SphereCap { sphere_radius, .. } = fit.primitive else {
            panic!("expected sphere cap");
        };
        assert!((sphere_radius - 12.0).abs() < 1e-4, "{sphere_radius}");
    }

    #[test]
    fn cone_reports_base_radius() {
        let data = data_for(
            Primitive::Cone {
                base_radius: 5.0,
                height: 20.0,
            },
            50,
        );
        let fit = fit_shape(ShapeKind::Cone, &data, &FittingParams::default()).unwrap();
        let Primitive::Cone { base_radius, height } = fit.primitive else {
            panic!("expected cone");
        };
        assert!((base_radius - 5.0).abs() < 1e-4, "{base_radius}");
        assert!((height - 20.0).abs() < 1e-12);
    }

    #[test]
    fn constant_offset_does_not_bias_the_fit() {
        let mut data = data_for(
            Primitive::Cylinder {
                radius: 3.0,
                height: 10.0,
            },
            30,
        );
        for v in data.volume.iter_mut() {
            *v += 7.5;
        }
        let fit = fit_shape(ShapeKind::Cylinder, &data, &FittingParams::default()).unwrap();
        let Primitive::Cylinder { radius, .. } = fit.primitive else {
            panic!("expected cylinder");
        };
        assert!((radius - 3.0).abs() < 1e-6);
    }

    #[test]
    fn too_few_points_fail() {
        let data = SegmentData::new(&[0.0, 1.0, 2.0], &[0.0, 1.0, 2.0], &[1.0, 1.0, 1.0]);
        let err = fit_shape(ShapeKind::Cylinder, &data, &FittingParams::default()).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::FitFailure {
                shape: ShapeKind::Cylinder,
                ..
            }
        ));
    }
}
