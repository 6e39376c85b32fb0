//! Geometric primitives and per-segment shape fitting.
//!
//! Every primitive is axisymmetric and described by its radius as a function
//! of the height `t` measured from the segment start. Volumes follow in closed
//! form:
//! - cylinder: `π r² t`;
//! - frustum: integral of a linearly varying radius `r₁ → r₂`;
//! - cone: apex at the segment start, `π R² t³ / (3 L²)`;
//! - sphere cap: pole at the segment start, `π t² (3R − t) / 3`.
//!
//! [`fit`] adjusts each primitive to the measured volumes with a bounded
//! Levenberg–Marquardt solver; [`classify`] compares the fits, weighs them
//! with the curvature discriminator and picks the segment's shape.

pub mod classify;
pub mod fit;

use crate::types::ShapeKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

pub use classify::{
    classify_and_fit, discriminate, ClassifierParams, SegmentClassification, ShapeCandidate,
    ShapeEvidence,
};
pub use fit::{fit_shape, FittingParams, SegmentData, ShapeFit};

/// A fitted primitive. Heights are measured from the segment start.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(
    tag = "kind",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Primitive {
    Cylinder {
        radius: f64,
        height: f64,
    },
    Frustum {
        bottom_radius: f64,
        top_radius: f64,
        height: f64,
    },
    /// Apex at the bottom of the segment.
    Cone {
        base_radius: f64,
        height: f64,
    },
    /// Pole at the bottom of the segment.
    SphereCap {
        sphere_radius: f64,
        cap_height: f64,
    },
    /// Every fit failed for this segment.
    Unfit {
        height: f64,
    },
}

impl Primitive {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Primitive::Cylinder { .. } => ShapeKind::Cylinder,
            Primitive::Frustum { .. } => ShapeKind::Frustum,
            Primitive::Cone { .. } => ShapeKind::Cone,
            Primitive::SphereCap { .. } => ShapeKind::SphereCap,
            Primitive::Unfit { .. } => ShapeKind::Unfit,
        }
    }

    /// Height covered by the primitive.
    pub fn height(&self) -> f64 {
        match *self {
            Primitive::Cylinder { height, .. }
            | Primitive::Frustum { height, .. }
            | Primitive::Cone { height, .. }
            | Primitive::Unfit { height } => height,
            Primitive::SphereCap { cap_height, .. } => cap_height,
        }
    }

    pub fn radius_at(&self, t: f64) -> f64 {
        match *self {
            Primitive::Cylinder { radius, .. } => radius,
            Primitive::Frustum {
                bottom_radius,
                top_radius,
                height,
            } => {
                if height > 0.0 {
                    bottom_radius + (top_radius - bottom_radius) * t / height
                } else {
                    bottom_radius
                }
            }
            Primitive::Cone {
                base_radius,
                height,
            } => {
                if height > 0.0 {
                    base_radius * t / height
                } else {
                    0.0
                }
            }
            Primitive::SphereCap { sphere_radius, .. } => {
                let t = t.clamp(0.0, 2.0 * sphere_radius);
                (t * (2.0 * sphere_radius - t)).max(0.0).sqrt()
            }
            Primitive::Unfit { .. } => 0.0,
        }
    }

    pub fn area_at(&self, t: f64) -> f64 {
        let r = self.radius_at(t);
        PI * r * r
    }

    /// Volume between the segment start and height `t`.
    pub fn volume_at(&self, t: f64) -> f64 {
        match *self {
            Primitive::Cylinder { radius, .. } => PI * radius * radius * t,
            Primitive::Frustum {
                bottom_radius: r1,
                top_radius: r2,
                height,
            } => {
                if height <= 0.0 {
                    return PI * r1 * r1 * t;
                }
                let d = r2 - r1;
                PI * (r1 * r1 * t + r1 * d * t * t / height + d * d * t.powi(3) / (3.0 * height * height))
            }
            Primitive::Cone {
                base_radius,
                height,
            } => {
                if height <= 0.0 {
                    return 0.0;
                }
                let k = base_radius / height;
                PI * k * k * t.powi(3) / 3.0
            }
            Primitive::SphereCap { sphere_radius, .. } => {
                let t = t.clamp(0.0, 2.0 * sphere_radius);
                PI * t * t * (3.0 * sphere_radius - t) / 3.0
            }
            Primitive::Unfit { .. } => 0.0,
        }
    }

    /// Named parameters for downstream consumers.
    pub fn parameters(&self) -> BTreeMap<&'static str, f64> {
        let pairs: Vec<(&'static str, f64)> = match *self {
            Primitive::Cylinder { radius, height } => vec![("radius", radius), ("height", height)],
            Primitive::Frustum {
                bottom_radius,
                top_radius,
                height,
            } => vec![
                ("bottom_radius", bottom_radius),
                ("top_radius", top_radius),
                ("height", height),
            ],
            Primitive::Cone {
                base_radius,
                height,
            } => vec![("base_radius", base_radius), ("height", height)],
            Primitive::SphereCap {
                sphere_radius,
                cap_height,
            } => vec![("sphere_radius", sphere_radius), ("cap_height", cap_height)],
            Primitive::Unfit { height } => vec![("height", height)],
        };
        pairs.into_iter().collect()
    }
}

/// Fitting and classification settings used per segment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapeParams {
    pub fitting: FittingParams,
    pub classifier: ClassifierParams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frustum_volume_matches_closed_form() {
        let f = Primitive::Frustum {
            bottom_radius: 2.0,
            top_radius: 5.0,
            height: 9.0,
        };
        let expected = PI * 9.0 / 3.0 * (4.0 + 10.0 + 25.0);
        assert!((f.volume_at(9.0) - expected).abs() < 1e-9);
        assert!((f.radius_at(4.5) - 3.5).abs() < 1e-12);
    }

    #[test]
    fn cone_is_a_frustum_from_zero() {
        let cone = Primitive::Cone {
            base_radius: 5.0,
            height: 20.0,
        };
        let frustum = Primitive::Frustum {
            bottom_radius: 0.0,
            top_radius: 5.0,
            height: 20.0,
        };
        for t in [0.0, 3.0, 11.0, 20.0] {
            assert!((cone.volume_at(t) - frustum.volume_at(t)).abs() < 1e-9);
        }
    }

    #[test]
    fn sphere_cap_volume_saturates_at_full_sphere() {
        let cap = Primitive::SphereCap {
            sphere_radius: 3.0,
            cap_height: 6.0,
        };
        let full = 4.0 / 3.0 * PI * 27.0;
        assert!((cap.volume_at(6.0) - full).abs() < 1e-9);
        assert!((cap.volume_at(8.0) - full).abs() < 1e-9);
        assert!((cap.radius_at(3.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn parameters_are_named() {
        let p = Primitive::Cylinder {
            radius: 1.5,
            height: 4.0,
        }
        .parameters();
        assert_eq!(p.get("radius"), Some(&1.5));
        assert_eq!(p.len(), 2);
    }
}
