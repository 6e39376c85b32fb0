//! One-dimensional smoothing kernels used by the conditioning cascade.
//!
//! All filters keep the input length. Window-based filters truncate or shift
//! their support at the edges instead of padding with zeros, so a constant
//! profile stays constant.

use nalgebra::{Matrix2, Vector2};
use serde::Serialize;
use thiserror::Error;

const EPS: f64 = 1e-12;

/// Reasons a single filter application can be rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("window {window} does not fit a profile of {len} samples")]
    WindowTooLarge { window: usize, len: usize },
    #[error("window {0} is not a positive odd size")]
    InvalidWindow(usize),
    #[error("gaussian sigma {0} must be finite and positive")]
    InvalidSigma(f64),
    #[error("local fit is singular around sample {0}")]
    Singular(usize),
    #[error("filter produced non-finite output")]
    NonFinite,
}

/// A concrete filter application, as recorded in the conditioning report.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "filter", rename_all = "camelCase")]
pub enum FilterStage {
    Median { window: usize },
    LocalLinear { window: usize },
    Gaussian { sigma: f64 },
}

impl FilterStage {
    /// Apply the filter to `values` sampled at `heights`.
    pub fn apply(&self, heights: &[f64], values: &[f64]) -> Result<Vec<f64>, FilterError> {
        let out = match *self {
            FilterStage::Median { window } => median_filter(values, window)?,
            FilterStage::LocalLinear { window } => local_linear_smooth(heights, values, window)?,
            FilterStage::Gaussian { sigma } => gaussian_smooth(values, sigma)?,
        };
        if out.iter().all(|v| v.is_finite()) {
            Ok(out)
        } else {
            Err(FilterError::NonFinite)
        }
    }
}

/// Running median with an odd window truncated at the profile edges.
pub fn median_filter(values: &[f64], window: usize) -> Result<Vec<f64>, FilterError> {
    if window == 0 || window % 2 == 0 {
        return Err(FilterError::InvalidWindow(window));
    }
    let half = window / 2;
    let n = values.len();
    let mut scratch = Vec::with_capacity(window);
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(n);
        scratch.clear();
        scratch.extend_from_slice(&values[lo..hi]);
        out.push(median_in_place(&mut scratch));
    }
    Ok(out)
}

/// Degree-1 least-squares smoothing over a sliding window of `window`
/// samples. Near the edges the window is shifted inwards rather than
/// shrunk, so every point is fitted from the same number of samples.
pub fn local_linear_smooth(
    heights: &[f64],
    values: &[f64],
    window: usize,
) -> Result<Vec<f64>, FilterError> {
    let n = values.len();
    if window < 3 || window % 2 == 0 {
        return Err(FilterError::InvalidWindow(window));
    }
    if window > n || heights.len() != n {
        return Err(FilterError::WindowTooLarge { window, len: n });
    }
    let half = window / 2;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let lo = i.saturating_sub(half).min(n - window);
        let xs = &heights[lo..lo + window];
        let ys = &values[lo..lo + window];
        let x_mean = xs.iter().sum::<f64>() / window as f64;

        let mut normal = Matrix2::<f64>::zeros();
        let mut rhs = Vector2::<f64>::zeros();
        for (&x, &y) in xs.iter().zip(ys) {
            let basis = Vector2::new(1.0, x - x_mean);
            normal += basis * basis.transpose();
            rhs += basis * y;
        }
        let coeffs = normal
            .try_inverse()
            .map(|inv| inv * rhs)
            .ok_or(FilterError::Singular(i))?;
        out.push(coeffs[0] + coeffs[1] * (heights[i] - x_mean));
    }
    Ok(out)
}

/// Gaussian smoothing in sample units with nearest-edge extension.
pub fn gaussian_smooth(values: &[f64], sigma: f64) -> Result<Vec<f64>, FilterError> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(FilterError::InvalidSigma(sigma));
    }
    Ok(convolve_clamped(values, &gaussian_kernel(sigma)))
}

/// Normalised Gaussian taps with radius `ceil(4 sigma)`.
///
/// `sigma` must be positive; callers validate it.
pub(crate) fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = ((4.0 * sigma).ceil() as usize).max(1);
    let mut taps: Vec<f64> = (0..=2 * radius)
        .map(|k| {
            let d = k as f64 - radius as f64;
            (-0.5 * (d / sigma).powi(2)).exp()
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    for t in &mut taps {
        *t /= sum;
    }
    taps
}

pub(crate) fn convolve_clamped(values: &[f64], taps: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }
    let radius = (taps.len() / 2) as isize;
    let last = n as isize - 1;
    (0..n as isize)
        .map(|i| {
            taps.iter()
                .enumerate()
                .map(|(k, w)| {
                    let j = (i + k as isize - radius).clamp(0, last) as usize;
                    w * values[j]
                })
                .sum()
        })
        .collect()
}

/// Finite-difference derivative of `values` with respect to `x`.
///
/// Central differences inside, one-sided differences at both ends. Zero or
/// negative steps are clamped to a tiny positive span.
pub fn gradient(values: &[f64], x: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(1);
            let hi = (i + 1).min(n - 1);
            (values[hi] - values[lo]) / (x[hi] - x[lo]).max(EPS)
        })
        .collect()
}

/// Finite-difference derivative with unit sample spacing.
pub fn sample_gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(1);
            let hi = (i + 1).min(n - 1);
            (values[hi] - values[lo]) / (hi - lo) as f64
        })
        .collect()
}

pub(crate) fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        0.5 * (values[mid - 1] + values[mid])
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Population standard deviation.
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Linear-interpolated percentile (`q` in `[0, 100]`).
pub(crate) fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_removes_isolated_spike() {
        let mut values = vec![1.0; 11];
        values[5] = 50.0;
        let out = median_filter(&values, 3).unwrap();
        assert!(out.iter().all(|v| (*v - 1.0).abs() < 1e-12), "{out:?}");
    }

    #[test]
    fn median_rejects_even_window() {
        assert_eq!(
            median_filter(&[1.0, 2.0, 3.0], 4),
            Err(FilterError::InvalidWindow(4))
        );
    }

    #[test]
    fn local_linear_reproduces_lines() {
        let heights: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let values: Vec<f64> = heights.iter().map(|h| 3.0 * h - 2.0).collect();
        let out = local_linear_smooth(&heights, &values, 11).unwrap();
        for (a, b) in out.iter().zip(&values) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn local_linear_rejects_oversized_window() {
        let heights = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(
            local_linear_smooth(&heights, &heights, 7),
            Err(FilterError::WindowTooLarge { window: 7, len: 5 })
        );
    }

    #[test]
    fn gaussian_preserves_constants_and_mass_near_centre() {
        let values = vec![4.0; 30];
        let out = gaussian_smooth(&values, 2.5).unwrap();
        assert!(out.iter().all(|v| (v - 4.0).abs() < 1e-12));

        let kernel = gaussian_kernel(1.3);
        let sum: f64 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert_eq!(kernel.len() % 2, 1);
    }

    #[test]
    fn gaussian_rejects_bad_sigma() {
        assert!(gaussian_smooth(&[1.0, 2.0], 0.0).is_err());
        assert!(gaussian_smooth(&[1.0, 2.0], f64::NAN).is_err());
    }

    #[test]
    fn percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((percentile(&values, 50.0) - 3.0).abs() < 1e-12);
        assert!((percentile(&values, 90.0) - 4.6).abs() < 1e-12);
    }

    #[test]
    fn gradient_of_quadratic_is_linear_inside() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| v * v).collect();
        let d = gradient(&y, &x);
        for i in 1..9 {
            assert!((d[i] - 2.0 * x[i]).abs() < 1e-9);
        }
    }
}
