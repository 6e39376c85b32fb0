use super::TimingBreakdown;
use crate::estimate::CountEstimate;
use crate::shapes::{ShapeCandidate, ShapeEvidence};
use crate::signal::ConditioningReport;
use crate::transitions::DetectionOutcome;
use crate::types::{SegmentationResult, ShapeKind};
use crate::validate::MergeAction;
use serde::Serialize;

/// Result produced by
/// [`ContainerAnalyzer::analyze_with_diagnostics`](crate::ContainerAnalyzer::analyze_with_diagnostics).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub result: SegmentationResult,
    pub trace: PipelineTrace,
}

/// End-to-end trace of one analysis call.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTrace {
    pub input: InputDescriptor,
    pub timings: TimingBreakdown,
    pub conditioning: ConditioningReport,
    pub snr: f64,
    pub estimate: CountEstimate,
    pub detection: DetectionOutcome,
    /// Classification of the segments as detected, before merging.
    pub segments: Vec<SegmentTrace>,
    pub merges: Vec<MergeAction>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDescriptor {
    pub samples: usize,
    pub height_span: f64,
    pub volume_span: f64,
}

/// Shape comparison for one detected segment.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTrace {
    pub start_index: usize,
    pub end_index: usize,
    pub chosen: ShapeKind,
    pub evidence: ShapeEvidence,
    pub candidates: Vec<ShapeCandidate>,
}
