//! Diagnostics returned alongside the segmentation.
//!
//! [`AnalysisReport`] bundles the [`SegmentationResult`](crate::SegmentationResult)
//! with a [`PipelineTrace`] that records what every stage decided: the
//! filters applied, the count votes, the candidates of each strategy and why
//! each was accepted or rejected, the shape comparison per segment and the
//! merges performed by the validator.

pub mod pipeline;
pub mod timing;

pub use pipeline::{AnalysisReport, InputDescriptor, PipelineTrace, SegmentTrace};
pub use timing::{StageTiming, TimingBreakdown};
