#![doc = include_str!("../README.md")]

// Public modules (stable-ish surface)
pub mod analyzer;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod types;

// Stage modules – public so each component can run on its own.
pub mod derivatives;
pub mod estimate;
pub mod shapes;
pub mod signal;
pub mod transitions;
pub mod validate;

// --- High-level re-exports -------------------------------------------------

// Main entry points: analyzer + results.
pub use crate::analyzer::{analyze, AnalyzerParams, ContainerAnalyzer};
pub use crate::error::{AnalysisError, Result};
pub use crate::types::{
    Confidence, DetectionMethod, Sample, Segment, SegmentCount, SegmentationResult, ShapeKind,
};

// Fitted primitives and their geometry helpers.
pub use crate::shapes::Primitive;

// High-level diagnostics returned by the analyzer.
pub use crate::diagnostics::{AnalysisReport, PipelineTrace};

// --- Prelude ---------------------------------------------------------------

/// Small prelude for quick experiments.
///
/// ```no_run
/// use container_geometry::prelude::*;
///
/// # fn main() -> container_geometry::Result<()> {
/// // A 30 cm tall cylinder of radius 5 cm, sampled every centimetre.
/// let samples: Vec<Sample> = (0..=30)
///     .map(|h| Sample::new(h as f64, std::f64::consts::PI * 25.0 * h as f64))
///     .collect();
///
/// let result = ContainerAnalyzer::new(AnalyzerParams::default()).analyze(&samples)?;
/// println!("{:?} error={:.4}", result.shape_kinds(), result.reconstruction_error);
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    pub use crate::{
        AnalyzerParams, ContainerAnalyzer, Primitive, Sample, SegmentationResult, ShapeKind,
    };
}

// --- Stage-level API (for tools & advanced users) --------------------------

pub mod stages {
    // Stage runners.
    pub use crate::derivatives::analyze_derivatives;
    pub use crate::estimate::predict_segment_count;
    pub use crate::shapes::{classify_and_fit, fit_shape};
    pub use crate::signal::{condition, condition_with_report};
    pub use crate::transitions::detect_transitions;
    pub use crate::validate::{profile_volume, validate_and_merge};

    // Stage inputs and outputs.
    pub use crate::derivatives::{Derivatives, PercentilePolicy};
    pub use crate::estimate::{CountEstimate, EstimatorParams};
    pub use crate::shapes::{
        ClassifierParams, FittingParams, SegmentClassification, SegmentData, ShapeCandidate,
        ShapeEvidence, ShapeFit, ShapeParams,
    };
    pub use crate::signal::{AreaProfile, ConditioningParams, ConditioningReport};
    pub use crate::transitions::{
        BoundaryEvaluation, CandidateSet, DetectionOutcome, DetectionParams, Rejection, Route,
        TransitionCandidate, TransitionMethod,
    };
    pub use crate::validate::{MergeAction, MergeReason, ResultContext, ValidationParams};

    // Structured diagnostics types.
    pub use crate::diagnostics::{InputDescriptor, SegmentTrace, StageTiming, TimingBreakdown};
}
