//! Error types for the segmentation engine.

use crate::types::ShapeKind;
use thiserror::Error;

/// Errors surfaced by the analysis entry points.
///
/// Only [`AnalysisError::DegenerateInput`] and configuration problems ever
/// reach the caller of `analyze`; [`AnalysisError::FitFailure`] is produced by
/// individual shape fits and consumed by the classifier.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("degenerate input: {reason}")]
    DegenerateInput { reason: String },

    #[error("{shape:?} fit failed: {reason}")]
    FitFailure { shape: ShapeKind, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl AnalysisError {
    pub(crate) fn degenerate(reason: impl Into<String>) -> Self {
        AnalysisError::DegenerateInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn fit_failure(shape: ShapeKind, reason: impl Into<String>) -> Self {
        AnalysisError::FitFailure {
            shape,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
