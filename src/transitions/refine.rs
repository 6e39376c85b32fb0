//! Boundary placement and validation on the measured volume curve.
//!
//! Candidates from either strategy only seed a search. The boundary itself is
//! the split of the enclosing bracket that minimises the summed squared
//! residual of two independent cubic fits of volume against height. Every
//! primitive has a cubic volume law, so a bracket holding one shape is
//! explained by a single cubic up to noise, while a genuine regime change
//! leaves a systematic misfit that the split removes.
//!
//! A split is accepted when
//! - the single-cubic misfit exceeds `min_relative_misfit` of the bracket's
//!   volume span,
//! - the split removes more than `variance_threshold` of the residual
//!   variance, and
//! - the F statistic of the two-cubic model over the single cubic exceeds
//!   `split_f_threshold`.
//!
//! After every accepted split the internal boundaries are re-positioned by
//! coordinate descent and the remaining brackets are tested as well. A first
//! split that lands between two transitions therefore slides onto one of
//! them, and the other is found in the neighbouring bracket.

use super::{DetectionParams, TransitionCandidate};
use crate::signal::AreaProfile;
use log::debug;
use nalgebra::{Matrix4, Vector4};
use serde::Serialize;
use std::collections::HashSet;

/// Extra parameters of the split model: a second cubic plus the position.
const SPLIT_EXTRA_DOF: f64 = 5.0;
/// Parameters of two independent cubics.
const SPLIT_MODEL_DOF: f64 = 8.0;
const MAX_REPOSITION_SWEEPS: usize = 20;

/// Why a candidate did not become a boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Rejection {
    /// The candidate sits on an accepted boundary.
    OnBoundary,
    /// Its bracket cannot host two segments of the minimum length.
    BracketTooShort,
    /// The bracket was already tried and rejected.
    BracketExhausted,
    /// The best split is within the merge distance of a boundary.
    TooClose,
    /// A single cubic already explains the bracket.
    NoMisfit,
    /// The split does not reduce the residual variance enough.
    LowGain,
    /// The split is not statistically significant.
    NotSignificant,
}

/// Outcome of evaluating one candidate.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryEvaluation {
    /// Candidate that opened the bracket; brackets tested after an accepted
    /// split carry their own start index.
    pub candidate: usize,
    pub bracket: (usize, usize),
    #[serde(skip_serializing_if = "Option::is_none")]
    pub split: Option<usize>,
    pub f_statistic: f64,
    pub variance_gain: f64,
    pub relative_misfit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
}

impl BoundaryEvaluation {
    pub fn accepted(&self) -> bool {
        self.rejection.is_none()
    }

    fn rejected(candidate: usize, bracket: (usize, usize), reason: Rejection) -> Self {
        Self {
            candidate,
            bracket,
            split: None,
            f_statistic: 0.0,
            variance_gain: 0.0,
            relative_misfit: 0.0,
            rejection: Some(reason),
        }
    }
}

/// Turn ranked candidates into an ordered boundary list that includes the
/// first and last sample index.
///
/// Candidates are visited by descending score. A candidate opens its
/// enclosing bracket; once a split is accepted the boundaries are
/// re-positioned and every bracket not yet rejected is tested in turn, so a
/// single good candidate can uncover several transitions.
pub fn place_boundaries(
    profile: &AreaProfile,
    candidates: &[TransitionCandidate],
    params: &DetectionParams,
) -> (Vec<usize>, Vec<BoundaryEvaluation>) {
    let n = profile.len();
    let last = n.saturating_sub(1);
    let mut state = Placement {
        profile,
        params,
        boundaries: vec![0, last],
        evaluations: Vec::with_capacity(candidates.len()),
        exhausted: HashSet::new(),
        min_len: params.min_segment_points.max(2),
        merge_distance: params.merge_distance(n),
    };
    if n < 2 {
        return (state.boundaries, state.evaluations);
    }

    let mut ranked: Vec<&TransitionCandidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));

    for cand in ranked {
        if cand.index == 0 || cand.index >= last || state.boundaries.contains(&cand.index) {
            state.evaluations.push(BoundaryEvaluation::rejected(
                cand.index,
                (cand.index, cand.index),
                Rejection::OnBoundary,
            ));
            continue;
        }
        let pos = state.boundaries.partition_point(|&b| b < cand.index);
        let bracket = (state.boundaries[pos - 1], state.boundaries[pos]);
        if state.exhausted.contains(&bracket) {
            state.evaluations.push(BoundaryEvaluation::rejected(
                cand.index,
                bracket,
                Rejection::BracketExhausted,
            ));
            continue;
        }
        if state.attempt(cand.index, bracket) {
            state.grow();
        }
    }
    (state.boundaries, state.evaluations)
}

struct Placement<'a> {
    profile: &'a AreaProfile,
    params: &'a DetectionParams,
    boundaries: Vec<usize>,
    evaluations: Vec<BoundaryEvaluation>,
    exhausted: HashSet<(usize, usize)>,
    min_len: usize,
    merge_distance: usize,
}

impl Placement<'_> {
    /// Evaluate one bracket; on success insert the split and re-position.
    fn attempt(&mut self, seed: usize, bracket: (usize, usize)) -> bool {
        let (a, c) = bracket;
        let lo = a + self.min_len - 1;
        let hi = c.saturating_sub(self.min_len - 1);
        if lo > hi {
            self.exhausted.insert(bracket);
            self.evaluations
                .push(BoundaryEvaluation::rejected(seed, bracket, Rejection::BracketTooShort));
            return false;
        }

        let mut eval = evaluate_bracket(self.profile, a, c, self.min_len, self.params);
        eval.candidate = seed;
        let last = self.profile.len() - 1;
        let accepted_split = match eval.split {
            Some(split) if eval.rejection.is_none() => {
                let crowded = self
                    .boundaries
                    .iter()
                    .any(|&b| b != 0 && b != last && b.abs_diff(split) < self.merge_distance);
                if crowded {
                    eval.rejection = Some(Rejection::TooClose);
                    None
                } else {
                    Some(split)
                }
            }
            _ => None,
        };
        self.evaluations.push(eval);

        let Some(split) = accepted_split else {
            self.exhausted.insert(bracket);
            return false;
        };
        debug!("place_boundaries: seed {seed} -> boundary {split} in [{a}, {c}]");
        let pos = self.boundaries.partition_point(|&b| b < split);
        self.boundaries.insert(pos, split);
        reposition(
            self.profile,
            &mut self.boundaries,
            self.min_len,
            self.merge_distance,
        );
        true
    }

    /// Test every untested bracket until none yields a split.
    fn grow(&mut self) {
        loop {
            let next = self
                .boundaries
                .windows(2)
                .map(|w| (w[0], w[1]))
                .find(|b| !self.exhausted.contains(b));
            let Some(bracket) = next else {
                return;
            };
            // A failed attempt exhausts the bracket, so the scan advances.
            self.attempt(bracket.0, bracket);
        }
    }
}

/// Coordinate descent on the internal boundaries: each moves to the best
/// split between its neighbours until no move lowers the two-cubic residual.
/// A boundary never moves closer than `merge_distance` to an internal
/// neighbour.
fn reposition(
    profile: &AreaProfile,
    boundaries: &mut [usize],
    min_len: usize,
    merge_distance: usize,
) {
    let x = &profile.heights;
    let y = &profile.volumes;
    let Some(&last) = boundaries.last() else {
        return;
    };
    for _ in 0..MAX_REPOSITION_SWEEPS {
        let mut moved = false;
        for k in 1..boundaries.len().saturating_sub(1) {
            let (a, c) = (boundaries[k - 1], boundaries[k + 1]);
            let mut lo = a + min_len - 1;
            let mut hi = c.saturating_sub(min_len - 1);
            if a != 0 {
                lo = lo.max(a + merge_distance);
            }
            if c != last {
                hi = hi.min(c.saturating_sub(merge_distance));
            }
            let Some((best, best_sse)) = best_split_within(x, y, a, c, lo, hi) else {
                continue;
            };
            let current = cubic_sse(x, y, a, boundaries[k]) + cubic_sse(x, y, boundaries[k], c);
            if best != boundaries[k] && best_sse < current * (1.0 - 1e-12) {
                debug!("place_boundaries: boundary {} moved to {}", boundaries[k], best);
                boundaries[k] = best;
                moved = true;
            }
        }
        if !moved {
            return;
        }
    }
}

/// Split of `[a, c]` with the lowest summed cubic residual, keeping
/// `min_len` samples on both sides.
fn best_split(x: &[f64], y: &[f64], a: usize, c: usize, min_len: usize) -> Option<(usize, f64)> {
    let hi = c.checked_sub(min_len - 1)?;
    best_split_within(x, y, a, c, a + min_len - 1, hi)
}

/// Best split of `[a, c]` among the positions `lo..=hi`; ties keep the
/// earliest position.
fn best_split_within(
    x: &[f64],
    y: &[f64],
    a: usize,
    c: usize,
    lo: usize,
    hi: usize,
) -> Option<(usize, f64)> {
    (lo..=hi)
        .map(|b| (b, cubic_sse(x, y, a, b) + cubic_sse(x, y, b, c)))
        .fold(None, |best: Option<(usize, f64)>, (b, sse)| match best {
            Some((_, s)) if s <= sse => best,
            _ => Some((b, sse)),
        })
}

/// Find the best split of `[a, c]` leaving `min_len` samples on both sides
/// and test it.
pub fn evaluate_bracket(
    profile: &AreaProfile,
    a: usize,
    c: usize,
    min_len: usize,
    params: &DetectionParams,
) -> BoundaryEvaluation {
    let x = &profile.heights;
    let y = &profile.volumes;
    let Some((split, split_sse)) = best_split(x, y, a, c, min_len) else {
        return BoundaryEvaluation::rejected(a, (a, c), Rejection::BracketTooShort);
    };

    let whole_sse = cubic_sse(x, y, a, c);
    let whole_n = (c - a + 1) as f64;
    let split_n = (c - a + 2) as f64;
    let whole_rms = (whole_sse / whole_n).sqrt();
    let split_ms = split_sse / split_n;
    let span = (y[c] - y[a]).abs();
    let relative_misfit = if span > 0.0 { whole_rms / span } else { 0.0 };

    let variance_gain = if whole_rms > 0.0 {
        (whole_rms * whole_rms - split_ms) / (whole_rms * whole_rms)
    } else {
        0.0
    };
    let dof = split_n - SPLIT_MODEL_DOF;
    let f_statistic = if whole_sse <= split_sse || dof <= 0.0 {
        0.0
    } else if split_sse <= f64::MIN_POSITIVE {
        f64::INFINITY
    } else {
        ((whole_sse - split_sse) / SPLIT_EXTRA_DOF) / (split_sse / dof)
    };

    let rejection = if relative_misfit <= params.min_relative_misfit {
        Some(Rejection::NoMisfit)
    } else if variance_gain <= params.variance_threshold {
        Some(Rejection::LowGain)
    } else if f_statistic <= params.split_f_threshold {
        Some(Rejection::NotSignificant)
    } else {
        None
    };

    BoundaryEvaluation {
        candidate: split,
        bracket: (a, c),
        split: Some(split),
        f_statistic,
        variance_gain,
        relative_misfit,
        rejection,
    }
}

/// Residual sum of squares of a least-squares cubic through the samples
/// `a..=b`. Four or fewer points are fitted exactly.
pub fn cubic_sse(x: &[f64], y: &[f64], a: usize, b: usize) -> f64 {
    if b < a || b - a + 1 <= 4 {
        return 0.0;
    }
    let xs = &x[a..=b];
    let ys = &y[a..=b];
    let n = xs.len() as f64;

    // Normalise both axes so the normal equations stay well conditioned on
    // short windows of long profiles.
    let x0 = 0.5 * (xs[0] + xs[xs.len() - 1]);
    let half = 0.5 * (xs[xs.len() - 1] - xs[0]);
    let sx = if half > 0.0 { half } else { 1.0 };
    let y_mean = ys.iter().sum::<f64>() / n;
    let sy = ys
        .iter()
        .fold(0.0f64, |m, v| m.max((v - y_mean).abs()))
        .max(f64::MIN_POSITIVE);

    let mut normal = Matrix4::<f64>::zeros();
    let mut rhs = Vector4::<f64>::zeros();
    for (&xv, &yv) in xs.iter().zip(ys) {
        let t = (xv - x0) / sx;
        let basis = Vector4::new(1.0, t, t * t, t * t * t);
        normal += basis * basis.transpose();
        rhs += basis * ((yv - y_mean) / sy);
    }
    let coeffs = match normal.svd(true, true).solve(&rhs, 1e-14) {
        Ok(c) => c,
        Err(_) => Vector4::zeros(),
    };
    let sse: f64 = xs
        .iter()
        .zip(ys)
        .map(|(&xv, &yv)| {
            let t = (xv - x0) / sx;
            let fit = coeffs[0] + t * (coeffs[1] + t * (coeffs[2] + t * coeffs[3]));
            ((yv - y_mean) / sy - fit).powi(2)
        })
        .sum();
    sse * sy * sy
}
