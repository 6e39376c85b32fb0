//! Derivative analysis of the conditioned area profile.
//!
//! Produces `dA/dh`, `d²A/dh²`, the stability metric
//! `S = |d²A/dh²| / (1 + |dA/dh|)` and an SNR estimate comparing the spread
//! of the conditioned profile with the residual removed by conditioning.

use crate::signal::filters::{gradient, std_dev};
use crate::signal::AreaProfile;
use log::debug;
use serde::{Deserialize, Serialize};

/// SNR reported for residual-free (synthetic) profiles.
pub const SNR_CAP: f64 = 1e6;
/// Residual spread, relative to the profile level, treated as exact.
const NOISE_FLOOR: f64 = 1e-9;

/// Derivative profiles over the sample heights.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Derivatives {
    pub first: Vec<f64>,
    pub second: Vec<f64>,
    pub stability: Vec<f64>,
    pub snr: f64,
}

/// Compute derivatives, stability metric and SNR for `profile`.
pub fn analyze_derivatives(profile: &AreaProfile) -> Derivatives {
    let first = gradient(&profile.area, &profile.heights);
    let second = gradient(&first, &profile.heights);
    let stability = first
        .iter()
        .zip(&second)
        .map(|(d1, d2)| d2.abs() / (1.0 + d1.abs()))
        .collect();
    let snr = estimate_snr(&profile.raw_area, &profile.area);
    debug!("analyze_derivatives: n={} snr={:.3}", profile.len(), snr);
    Derivatives {
        first,
        second,
        stability,
        snr,
    }
}

/// Range of the conditioned profile over the standard deviation of what the
/// conditioning removed, capped at [`SNR_CAP`].
pub fn estimate_snr(raw: &[f64], conditioned: &[f64]) -> f64 {
    let residual: Vec<f64> = raw.iter().zip(conditioned).map(|(r, c)| r - c).collect();
    let noise = std_dev(&residual);
    let (lo, hi) = conditioned
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = if hi >= lo { hi - lo } else { 0.0 };
    // Round-off on an exact profile is not noise.
    let level = lo.abs().max(hi.abs()).max(range);
    if noise <= NOISE_FLOOR * level {
        return SNR_CAP;
    }
    (range / noise).min(SNR_CAP)
}

/// Settings for the SNR-driven detection percentile.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PercentilePolicy {
    pub use_adaptive_threshold: bool,
    /// Fixed percentile and upper end of the adaptive range.
    pub percentile: f64,
    /// Lower end of the adaptive range, reached for very noisy profiles.
    pub min_percentile: f64,
    /// SNR at or below which `min_percentile` applies.
    pub noisy_snr: f64,
    /// SNR at or above which `percentile` applies.
    pub clean_snr: f64,
}

impl Default for PercentilePolicy {
    fn default() -> Self {
        Self {
            use_adaptive_threshold: true,
            percentile: 96.0,
            min_percentile: 70.0,
            noisy_snr: 5.0,
            clean_snr: 100.0,
        }
    }
}

impl PercentilePolicy {
    /// Detection percentile for a profile with the given SNR. Lower SNR
    /// yields a lower (more permissive) percentile, interpolated on a log
    /// scale between `noisy_snr` and `clean_snr`.
    pub fn percentile_for(&self, snr: f64) -> f64 {
        let hi = self.percentile.clamp(0.0, 100.0);
        if !self.use_adaptive_threshold {
            return hi;
        }
        let lo = self.min_percentile.clamp(0.0, hi);
        let (a, b) = (self.noisy_snr.max(1e-9), self.clean_snr.max(1e-9));
        if b <= a || !snr.is_finite() {
            return hi;
        }
        let t = ((snr.max(1e-9).ln() - a.ln()) / (b.ln() - a.ln())).clamp(0.0, 1.0);
        lo + t * (hi - lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_from_area(area: Vec<f64>, raw: Vec<f64>) -> AreaProfile {
        let n = area.len();
        AreaProfile {
            heights: (0..n).map(|i| i as f64).collect(),
            volumes: vec![0.0; n],
            raw_area: raw,
            area,
        }
    }

    #[test]
    fn linear_area_has_zero_stability() {
        let area: Vec<f64> = (0..20).map(|i| 2.0 * i as f64).collect();
        let d = analyze_derivatives(&profile_from_area(area.clone(), area));
        assert!(d.first.iter().all(|v| (v - 2.0).abs() < 1e-12));
        assert!(d.stability.iter().all(|s| s.abs() < 1e-12));
        assert_eq!(d.snr, SNR_CAP);
    }

    #[test]
    fn stability_discounts_steep_gradients() {
        let heights: Vec<f64> = (0..30).map(|i| i as f64 * 0.1).collect();
        let area: Vec<f64> = heights.iter().map(|h| h * h * 10.0).collect();
        let profile = AreaProfile {
            heights,
            volumes: vec![0.0; 30],
            raw_area: area.clone(),
            area,
        };
        let d = analyze_derivatives(&profile);
        // Same curvature everywhere, steeper slope further up.
        assert!(d.stability[25] < d.stability[5]);
    }

    #[test]
    fn noisier_profiles_get_lower_percentiles() {
        let policy = PercentilePolicy::default();
        assert_eq!(policy.percentile_for(1e6), 96.0);
        assert_eq!(policy.percentile_for(1.0), 70.0);
        let mid = policy.percentile_for(20.0);
        assert!(mid > 70.0 && mid < 96.0, "{mid}");
        assert!(policy.percentile_for(10.0) < mid);
    }

    #[test]
    fn fixed_percentile_when_not_adaptive() {
        let policy = PercentilePolicy {
            use_adaptive_threshold: false,
            percentile: 92.0,
            ..Default::default()
        };
        assert_eq!(policy.percentile_for(2.0), 92.0);
    }

    #[test]
    fn snr_reflects_residual_spread() {
        let conditioned: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let raw: Vec<f64> = conditioned
            .iter()
            .enumerate()
            .map(|(i, v)| if i % 2 == 0 { v + 1.0 } else { v - 1.0 })
            .collect();
        let snr = estimate_snr(&raw, &conditioned);
        assert!((snr - 49.0).abs() < 1e-9, "{snr}");
    }
}
