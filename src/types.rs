use crate::shapes::Primitive;
use serde::{Deserialize, Serialize};

/// One calibration reading: liquid height and the cumulative volume below it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub height: f64,
    pub volume: f64,
}

impl Sample {
    pub fn new(height: f64, volume: f64) -> Self {
        Self { height, volume }
    }
}

impl From<(f64, f64)> for Sample {
    fn from((height, volume): (f64, f64)) -> Self {
        Self { height, volume }
    }
}

/// Discrete confidence grade shared by the count estimator and the
/// transition candidates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Predicted number of geometric segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SegmentCount {
    One,
    Two,
    ThreeOrMore,
}

impl SegmentCount {
    /// Clamp a raw vote into the `{1, 2, >=3}` range.
    pub fn from_votes(count: usize) -> Self {
        match count {
            0 | 1 => SegmentCount::One,
            2 => SegmentCount::Two,
            _ => SegmentCount::ThreeOrMore,
        }
    }

    pub fn as_usize(self) -> usize {
        match self {
            SegmentCount::One => 1,
            SegmentCount::Two => 2,
            SegmentCount::ThreeOrMore => 3,
        }
    }
}

/// Primitive family of a segment. `Unfit` marks segments where every shape
/// fit failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShapeKind {
    Cylinder,
    Frustum,
    Cone,
    SphereCap,
    Unfit,
}

impl ShapeKind {
    /// Shapes tried by the fitter, simplest first.
    pub const CANDIDATES: [ShapeKind; 4] = [
        ShapeKind::Cylinder,
        ShapeKind::Frustum,
        ShapeKind::Cone,
        ShapeKind::SphereCap,
    ];

    /// Position in the simplicity order used to break ties.
    pub fn simplicity_rank(self) -> usize {
        match self {
            ShapeKind::Cylinder => 0,
            ShapeKind::Frustum => 1,
            ShapeKind::Cone => 2,
            ShapeKind::SphereCap => 3,
            ShapeKind::Unfit => 4,
        }
    }

    /// True when a segment of kind `other` can be represented by `self`.
    ///
    /// A frustum covers cylinders and cones; every fitted kind covers an
    /// unfit segment.
    pub fn generalizes(self, other: ShapeKind) -> bool {
        match (self, other) {
            (ShapeKind::Unfit, _) => false,
            (_, ShapeKind::Unfit) => true,
            (a, b) if a == b => true,
            (ShapeKind::Frustum, ShapeKind::Cylinder) | (ShapeKind::Frustum, ShapeKind::Cone) => {
                true
            }
            _ => false,
        }
    }
}

/// How the final boundaries were obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectionMethod {
    /// Percentile-peak strategy alone.
    Percentile,
    /// Stability-jump strategy alone.
    Stability,
    /// Both strategies ran and agreed on at least one boundary.
    Reconciled,
    /// The preferred strategy produced nothing usable; the percentile-peak
    /// result was used instead.
    PercentileFallback,
}

/// Contiguous index range assigned to one fitted primitive.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start_index: usize,
    pub end_index: usize,
    pub start_height: f64,
    pub end_height: f64,
    pub shape: Primitive,
    /// RMS volume residual relative to the segment's volume span.
    pub fit_error: f64,
    pub confidence: f64,
}

impl Segment {
    pub fn kind(&self) -> ShapeKind {
        self.shape.kind()
    }

    pub fn height_span(&self) -> f64 {
        self.end_height - self.start_height
    }

    pub fn len(&self) -> usize {
        self.end_index - self.start_index + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end_index < self.start_index
    }

    /// Volume enclosed by the fitted primitive over the segment height.
    pub fn fitted_volume(&self) -> f64 {
        self.shape.volume_at(self.height_span())
    }
}

/// Final output of one analysis call.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationResult {
    pub segments: Vec<Segment>,
    /// Relative difference between the integrated fitted volume and the
    /// measured volume span.
    pub reconstruction_error: f64,
    /// RMS deviation of the piecewise volume curve relative to the measured
    /// volume span.
    pub curve_rms_error: f64,
    pub processing_confidence: f64,
    /// Set when no internal boundary could be validated.
    pub low_confidence: bool,
    pub predicted_count: SegmentCount,
    pub count_confidence: Confidence,
    pub detection_method: DetectionMethod,
}

impl SegmentationResult {
    /// Internal boundaries plus the first and last sample index.
    pub fn boundaries(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.segments.len() + 1);
        if let Some(first) = self.segments.first() {
            out.push(first.start_index);
        }
        out.extend(self.segments.iter().map(|s| s.end_index));
        out
    }

    pub fn shape_kinds(&self) -> Vec<ShapeKind> {
        self.segments.iter().map(Segment::kind).collect()
    }

    /// Sum of the fitted primitive volumes.
    pub fn fitted_volume(&self) -> f64 {
        crate::validate::profile_volume(&self.segments)
    }
}
