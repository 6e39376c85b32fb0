mod common;

use common::init_logger;
use common::synthetic_profile::{sample_stack, with_volume_noise, Solid};
use container_geometry::config::params_from_json;
use container_geometry::{analyze, AnalysisError, AnalyzerParams, Sample, SegmentationResult};

fn profiles() -> Vec<Vec<Sample>> {
    let cone_cyl = [
        Solid::Cone {
            radius: 5.0,
            height: 20.0,
        },
        Solid::Cylinder {
            radius: 5.0,
            height: 30.0,
        },
    ];
    let three = [
        Solid::Cylinder {
            radius: 6.0,
            height: 20.0,
        },
        Solid::Frustum {
            bottom: 6.0,
            top: 3.0,
            height: 15.0,
        },
        Solid::Cylinder {
            radius: 3.0,
            height: 20.0,
        },
    ];
    let clean = sample_stack(&cone_cyl, 50);
    vec![
        sample_stack(
            &[Solid::Cylinder {
                radius: 5.0,
                height: 50.0,
            }],
            50,
        ),
        with_volume_noise(&clean, 0.02, 7),
        clean,
        sample_stack(&three, 100),
    ]
}

fn run(samples: &[Sample]) -> SegmentationResult {
    analyze(samples, &AnalyzerParams::default()).expect("valid profile")
}

#[test]
fn segments_partition_the_samples() {
    init_logger();
    for samples in profiles() {
        let result = run(&samples);
        let segments = &result.segments;
        assert!(!segments.is_empty());
        assert_eq!(segments[0].start_index, 0);
        assert_eq!(segments[segments.len() - 1].end_index, samples.len() - 1);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end_index, pair[1].start_index);
        }
        for segment in segments {
            assert!(segment.end_index > segment.start_index);
            assert_eq!(segment.start_height, samples[segment.start_index].height);
            assert_eq!(segment.end_height, samples[segment.end_index].height);
            assert!((0.0..=1.0).contains(&segment.confidence));
        }
        assert!((0.0..=1.0).contains(&result.processing_confidence));
        assert_eq!(result.low_confidence, segments.len() == 1);
    }
}

#[test]
fn analysis_is_deterministic() {
    init_logger();
    for samples in profiles() {
        let first = run(&samples);
        let second = run(&samples);
        assert_eq!(first.segments, second.segments);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }
}

#[test]
fn fitted_volume_matches_reconstruction_error() {
    init_logger();
    for samples in profiles() {
        let result = run(&samples);
        let measured = samples[samples.len() - 1].volume - samples[0].volume;
        let gap = (result.fitted_volume() - measured).abs() / measured;
        assert!(
            (gap - result.reconstruction_error).abs() <= 1e-9,
            "gap {gap} vs reported {}",
            result.reconstruction_error
        );
    }
}

#[test]
fn wider_median_never_adds_segments() {
    init_logger();
    let samples = &profiles()[2];
    let mut previous = usize::MAX;
    for window in (3..=15).step_by(2) {
        let mut params = AnalyzerParams::default();
        params.conditioning.median_window = Some(window);
        let count = analyze(samples, &params).unwrap().segments.len();
        assert!(count <= previous, "window {window} gave {count} segments");
        assert!(count >= 1);
        previous = count;
    }
}

#[test]
fn degenerate_inputs_are_rejected() {
    init_logger();
    let params = AnalyzerParams::default();
    let cylinder = |n: usize| {
        sample_stack(
            &[Solid::Cylinder {
                radius: 2.0,
                height: 10.0,
            }],
            n,
        )
    };

    let too_short = cylinder(params.min_points - 1);
    assert!(matches!(
        analyze(&too_short, &params),
        Err(AnalysisError::DegenerateInput { .. })
    ));

    let mut reversed = cylinder(30);
    reversed.reverse();
    assert!(matches!(
        analyze(&reversed, &params),
        Err(AnalysisError::DegenerateInput { .. })
    ));

    let flat: Vec<Sample> = (0..30).map(|i| Sample::new(1.0, i as f64)).collect();
    assert!(matches!(
        analyze(&flat, &params),
        Err(AnalysisError::DegenerateInput { .. })
    ));

    let mut with_nan = cylinder(30);
    with_nan[10].volume = f64::NAN;
    assert!(matches!(
        analyze(&with_nan, &params),
        Err(AnalysisError::DegenerateInput { .. })
    ));
}

#[test]
fn invalid_parameters_are_reported_before_analysis() {
    init_logger();
    let mut params = AnalyzerParams::default();
    params.detection.variance_threshold = 1.5;
    let samples = &profiles()[0];
    assert!(matches!(
        analyze(samples, &params),
        Err(AnalysisError::InvalidConfig(_))
    ));
}

#[test]
fn partial_config_changes_only_named_fields() {
    init_logger();
    let params = params_from_json(r#"{ "detection": { "method": "legacy" } }"#).unwrap();
    let defaults = AnalyzerParams::default();
    assert_eq!(params.min_points, defaults.min_points);
    assert_eq!(
        params.detection.variance_threshold,
        defaults.detection.variance_threshold
    );
    let result = analyze(&profiles()[2], &params).unwrap();
    assert_eq!(result.segments.len(), 2);
}
