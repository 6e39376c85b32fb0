//! Analyzer pipeline driving the segmentation end-to-end.
//!
//! The [`ContainerAnalyzer`] exposes a simple API: feed the height/volume
//! samples of one container and get back the ordered segments with their
//! fitted primitives. Internally it runs the conditioning cascade, the
//! derivative analysis, the segment-count vote, transition detection, shape
//! classification per segment and the validation/merge passes.
//!
//! Typical usage:
//! ```no_run
//! use container_geometry::{AnalyzerParams, ContainerAnalyzer, Sample};
//!
//! # fn example(samples: Vec<Sample>) -> container_geometry::Result<()> {
//! let analyzer = ContainerAnalyzer::new(AnalyzerParams::default());
//! let report = analyzer.analyze_with_diagnostics(&samples)?;
//! for segment in &report.result.segments {
//!     println!("{:?} {:.2}..{:.2}", segment.kind(), segment.start_height, segment.end_height);
//! }
//! # Ok(())
//! # }
//! ```
use super::params::AnalyzerParams;
use crate::derivatives::analyze_derivatives;
use crate::diagnostics::timing::elapsed_ms;
use crate::diagnostics::{
    AnalysisReport, InputDescriptor, PipelineTrace, SegmentTrace, TimingBreakdown,
};
use crate::error::{AnalysisError, Result};
use crate::estimate::predict_segment_count;
use crate::shapes::{classify_and_fit, SegmentClassification};
use crate::signal::{condition_with_report, AreaProfile};
use crate::transitions::detect_transitions;
use crate::types::{Sample, SegmentationResult};
use crate::validate::{validate_and_merge, ResultContext};
use log::debug;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use std::time::Instant;

/// Segmentation engine holding one validated parameter set.
#[derive(Clone, Debug)]
pub struct ContainerAnalyzer {
    params: AnalyzerParams,
}

impl Default for ContainerAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerParams::default())
    }
}

impl ContainerAnalyzer {
    /// Create an analyzer with the supplied parameters.
    ///
    /// The parameters are checked on every call to `analyze`, so an invalid
    /// set surfaces as [`AnalysisError::InvalidConfig`] there.
    pub fn new(params: AnalyzerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AnalyzerParams {
        &self.params
    }

    /// Segment `samples`, returning only the result.
    pub fn analyze(&self, samples: &[Sample]) -> Result<SegmentationResult> {
        self.analyze_with_diagnostics(samples).map(|report| report.result)
    }

    /// Segment `samples` and return both the result and a stage-by-stage
    /// trace.
    pub fn analyze_with_diagnostics(&self, samples: &[Sample]) -> Result<AnalysisReport> {
        self.params.validate()?;
        if samples.len() < self.params.min_points {
            return Err(AnalysisError::degenerate(format!(
                "{} samples, at least {} required",
                samples.len(),
                self.params.min_points
            )));
        }
        debug!(
            "ContainerAnalyzer::analyze start n={} method={:?}",
            samples.len(),
            self.params.detection.method
        );
        let total_start = Instant::now();
        let mut timings = TimingBreakdown::default();

        let stage = Instant::now();
        let (profile, conditioning) = condition_with_report(samples, &self.params.conditioning)?;
        timings.record("conditioning", stage);

        let stage = Instant::now();
        let derivatives = analyze_derivatives(&profile);
        timings.record("derivatives", stage);

        let stage = Instant::now();
        let estimate = predict_segment_count(&profile, &derivatives, &self.params.estimator);
        timings.record("estimate", stage);
        debug!(
            "ContainerAnalyzer::analyze estimate={:?} ({:?}) votes={:?}",
            estimate.count, estimate.confidence, estimate.votes
        );

        let stage = Instant::now();
        let detection =
            detect_transitions(&profile, &derivatives, &estimate, &self.params.detection);
        timings.record("transitions", stage);

        let stage = Instant::now();
        let classified = self.classify_segments(&profile, &detection.boundaries);
        timings.record("classification", stage);
        let segment_traces: Vec<SegmentTrace> = classified
            .iter()
            .map(|c| SegmentTrace {
                start_index: c.segment.start_index,
                end_index: c.segment.end_index,
                chosen: c.segment.kind(),
                evidence: c.evidence.clone(),
                candidates: c.candidates.clone(),
            })
            .collect();

        let stage = Instant::now();
        let context = ResultContext {
            predicted_count: estimate.count,
            count_confidence: estimate.confidence,
            detection_method: detection.method,
            low_confidence: detection.low_confidence,
        };
        let (result, merges) = validate_and_merge(
            &profile,
            classified,
            context,
            &self.params.shapes,
            &self.params.validation,
        );
        timings.record("validation", stage);
        timings.total_ms = elapsed_ms(total_start);

        debug!(
            "ContainerAnalyzer::analyze done segments={} recon={:.4} confidence={:.3} total_ms={:.2}",
            result.segments.len(),
            result.reconstruction_error,
            result.processing_confidence,
            timings.total_ms
        );

        let trace = PipelineTrace {
            input: InputDescriptor {
                samples: profile.len(),
                height_span: profile.height_span(),
                volume_span: profile.volume_span(),
            },
            timings,
            conditioning,
            snr: derivatives.snr,
            estimate,
            detection,
            segments: segment_traces,
            merges,
        };
        Ok(AnalysisReport { result, trace })
    }

    fn classify_segments(
        &self,
        profile: &AreaProfile,
        boundaries: &[usize],
    ) -> Vec<SegmentClassification> {
        let shapes = &self.params.shapes;
        let spans: Vec<(usize, usize)> = boundaries.windows(2).map(|w| (w[0], w[1])).collect();
        #[cfg(feature = "parallel")]
        let iter = spans.par_iter();
        #[cfg(not(feature = "parallel"))]
        let iter = spans.iter();
        iter.map(|&(start, end)| classify_and_fit(profile, start, end, shapes))
            .collect()
    }
}
