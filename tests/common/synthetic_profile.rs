//! Synthetic calibration curves built from stacked solids.

use container_geometry::Sample;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// One solid of a synthetic container, listed bottom to top.
#[derive(Clone, Copy, Debug)]
pub enum Solid {
    Cylinder { radius: f64, height: f64 },
    Frustum { bottom: f64, top: f64, height: f64 },
    /// Apex at the bottom.
    Cone { radius: f64, height: f64 },
    /// Bottom cap of a sphere, pole at the bottom.
    SphereCap { sphere_radius: f64, height: f64 },
}

impl Solid {
    pub fn height(&self) -> f64 {
        match *self {
            Solid::Cylinder { height, .. }
            | Solid::Frustum { height, .. }
            | Solid::Cone { height, .. }
            | Solid::SphereCap { height, .. } => height,
        }
    }

    /// Volume between the solid's base and `t` (clamped to its height).
    pub fn volume_to(&self, t: f64) -> f64 {
        let t = t.clamp(0.0, self.height());
        match *self {
            Solid::Cylinder { radius, .. } => PI * radius * radius * t,
            Solid::Frustum { bottom, top, height } => {
                let d = top - bottom;
                PI * (bottom * bottom * t
                    + bottom * d * t * t / height
                    + d * d * t.powi(3) / (3.0 * height * height))
            }
            Solid::Cone { radius, height } => {
                let k = radius / height;
                PI * k * k * t.powi(3) / 3.0
            }
            Solid::SphereCap { sphere_radius, .. } => {
                PI * t * t * (3.0 * sphere_radius - t) / 3.0
            }
        }
    }
}

/// Total height of a stack.
pub fn stack_height(solids: &[Solid]) -> f64 {
    solids.iter().map(Solid::height).sum()
}

/// Cumulative volume of the stack at height `h`.
pub fn stack_volume(solids: &[Solid], h: f64) -> f64 {
    let mut base = 0.0;
    let mut acc = 0.0;
    for solid in solids {
        acc += solid.volume_to(h - base);
        base += solid.height();
        if h <= base {
            break;
        }
    }
    acc
}

/// Heights where one solid ends and the next begins.
pub fn junction_heights(solids: &[Solid]) -> Vec<f64> {
    let mut base = 0.0;
    let mut out = Vec::new();
    for solid in &solids[..solids.len().saturating_sub(1)] {
        base += solid.height();
        out.push(base);
    }
    out
}

/// `n` noise-free samples evenly spaced over the stack height.
pub fn sample_stack(solids: &[Solid], n: usize) -> Vec<Sample> {
    assert!(n >= 2, "need at least two samples");
    let total = stack_height(solids);
    (0..n)
        .map(|i| {
            let h = total * i as f64 / (n - 1) as f64;
            Sample::new(h, stack_volume(solids, h))
        })
        .collect()
}

/// Adds Gaussian volume noise with a standard deviation of `fraction` times
/// the mean volume increment between samples. The first sample keeps its
/// volume.
pub fn with_volume_noise(samples: &[Sample], fraction: f64, seed: u64) -> Vec<Sample> {
    assert!(samples.len() >= 2, "need at least two samples");
    let first = samples[0].volume;
    let last = samples[samples.len() - 1].volume;
    let sigma = fraction * (last - first) / (samples.len() - 1) as f64;
    let mut rng = StdRng::seed_from_u64(seed);
    samples
        .iter()
        .enumerate()
        .map(|(i, s)| {
            if i == 0 {
                *s
            } else {
                Sample::new(s.height, s.volume + sigma * standard_normal(&mut rng))
            }
        })
        .collect()
}

/// Box–Muller transform.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Index of the sample closest to height `h`.
pub fn nearest_index(samples: &[Sample], h: f64) -> usize {
    samples
        .iter()
        .enumerate()
        .min_by(|a, b| {
            (a.1.height - h)
                .abs()
                .total_cmp(&(b.1.height - h).abs())
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}
