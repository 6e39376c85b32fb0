//! Container analyzer orchestrating the segmentation stages.
//!
//! Overview
//! - Derives the cross-sectional area `A(h) = dV/dh` from the cumulative
//!   volume samples and conditions it through an adaptive filter cascade
//!   (median, local-linear, Gaussian) with a plain Gaussian fallback.
//! - Computes first and second derivatives, the stability metric
//!   `|A''| / (1 + |A'|)` and a signal-to-noise estimate that drives the
//!   adaptive detection percentile.
//! - Votes on the number of segments (one, two, three or more) and routes
//!   transition detection to the percentile strategy, the stability strategy
//!   or both.
//! - Places boundaries by a piecewise-cubic split search on the measured
//!   volumes around each candidate, accepting only splits that reduce the
//!   residual variance enough.
//! - Fits cylinder, frustum, cone and sphere-cap primitives to every segment,
//!   biases the choice with curvature evidence and picks the simplest shape
//!   among near-ties.
//! - Merges over-segmented neighbours and scores the reconstruction.
//!
//! Modules
//! - [`params`] – configuration types for every stage.
//! - `pipeline` – the [`ContainerAnalyzer`] implementation.

pub mod params;
mod pipeline;

pub use params::AnalyzerParams;
pub use pipeline::ContainerAnalyzer;

use crate::error::Result;
use crate::types::{Sample, SegmentationResult};

/// One-shot convenience wrapper around [`ContainerAnalyzer::analyze`].
pub fn analyze(samples: &[Sample], params: &AnalyzerParams) -> Result<SegmentationResult> {
    ContainerAnalyzer::new(params.clone()).analyze(samples)
}
