use approx::assert_abs_diff_eq;
use tomotilt_core::{AngularPosition, DisplacementComponent, DisplacementSample, SweepDirection};
use tomotilt_eucentric::{
    CalibrationError, CalibratorParams, EucentricAxisCalibrator, EucentricModel, FitStage,
};

fn synthetic(angles: &[f64], f: impl Fn(f64) -> f64) -> Vec<DisplacementSample> {
    angles
        .iter()
        .map(|&deg| DisplacementSample::new(AngularPosition::from_degrees(deg), 0.0, f(deg.to_radians())))
        .collect()
}

fn planar(y: f64, z: f64) -> impl Fn(f64) -> f64 {
    move |t| y * (1.0 - t.cos()) + z * t.sin()
}

const SWEEP: [f64; 7] = [-10.0, -5.0, 0.0, 5.0, 10.0, 15.0, 20.0];

/// `[dx, dy]` in meters, measured at 1° steps from 0° to 10°.
const FIXTURE: [[f64; 2]; 11] = [
    [0.0, 0.0],
    [-4.13e-7, -6.41e-6],
    [-4.9e-7, -1.272e-5],
    [-5.4e-7, -1.892e-5],
    [-5.8e-7, -2.502e-5],
    [-6.3e-7, -3.101e-5],
    [-6.7e-7, -3.690e-5],
    [-7.1e-7, -4.267e-5],
    [-7.5e-7, -4.832e-5],
    [-7.9e-7, -5.387e-5],
    [-8.27e-7, -5.930e-5],
];

#[test]
fn recovers_noiseless_planar_offset() {
    let samples = synthetic(&SWEEP, planar(5.0, 3.0));
    let fit = EucentricAxisCalibrator::default().fit(&samples).expect("fit");
    assert_abs_diff_eq!(fit.y0, 5.0, epsilon = 1e-3);
    assert_abs_diff_eq!(fit.z0, 3.0, epsilon = 1e-3);
    assert_eq!(fit.direction, SweepDirection::Ascending);
    assert_eq!(fit.stage, FitStage::Samples);
    assert_eq!(fit.samples_used, 7);
    assert!(fit.r.is_none());
}

#[test]
fn densified_stage_alone_is_close() {
    let samples = synthetic(&SWEEP, planar(5.0, 3.0));
    let fit = EucentricAxisCalibrator::new(CalibratorParams {
        refine_on_samples: false,
        ..CalibratorParams::default()
    })
    .fit(&samples)
    .expect("fit");
    assert_eq!(fit.stage, FitStage::Densified);
    assert_abs_diff_eq!(fit.y0, 5.0, epsilon = 0.5);
    assert_abs_diff_eq!(fit.z0, 3.0, epsilon = 0.05);
}

#[test]
fn reversed_input_gives_same_offsets() {
    let forward = synthetic(&SWEEP, planar(5.0, 3.0));
    let mut backward = forward.clone();
    backward.reverse();

    let calibrator = EucentricAxisCalibrator::default();
    let a = calibrator.fit(&forward).expect("forward");
    let b = calibrator.fit(&backward).expect("backward");

    assert_eq!(a.y0, b.y0);
    assert_eq!(a.z0, b.z0);
    assert_eq!(b.direction, SweepDirection::Descending);
    assert_abs_diff_eq!(b.y0_along_sweep(), -a.y0_along_sweep());
}

#[test]
fn fixture_fit_converges_with_small_errors() {
    let samples: Vec<_> = FIXTURE
        .iter()
        .enumerate()
        .map(|(i, [dx, dy])| DisplacementSample::new(AngularPosition::from_degrees(i as f64), *dx, *dy))
        .collect();

    let fit = EucentricAxisCalibrator::default().fit(&samples).expect("fit");
    for v in [fit.y0, fit.z0, fit.sigma_y0, fit.sigma_z0] {
        assert!(v.is_finite());
    }
    assert!(fit.sigma_y0 < fit.y0.abs(), "y0 {} ± {}", fit.y0, fit.sigma_y0);
    assert!(fit.sigma_z0 < fit.z0.abs(), "z0 {} ± {}", fit.z0, fit.sigma_z0);
    assert!(fit.z0 < 0.0);
    assert!(fit.rms_residual < 1e-7);
}

#[test]
fn x_component_is_selectable() {
    let samples: Vec<_> = synthetic(&SWEEP, planar(1.0, 2.0))
        .into_iter()
        .map(|s| DisplacementSample::new(s.angle, s.dy, 0.0))
        .collect();
    let fit = EucentricAxisCalibrator::new(CalibratorParams {
        component: DisplacementComponent::X,
        ..CalibratorParams::default()
    })
    .fit(&samples)
    .expect("fit");
    assert_abs_diff_eq!(fit.y0, 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(fit.z0, 2.0, epsilon = 1e-6);
}

#[test]
fn insufficient_data() {
    let samples = synthetic(&[0.0, 5.0], planar(5.0, 3.0));
    assert_eq!(
        EucentricAxisCalibrator::default().fit(&samples),
        Err(CalibrationError::InsufficientData { got: 2, need: 3 })
    );
    assert!(matches!(
        EucentricAxisCalibrator::default().fit(&[]),
        Err(CalibrationError::InsufficientData { got: 0, .. })
    ));
}

#[test]
fn tilted_model_scales_offsets() {
    let tilt = 40.0f64;
    let k = 1.0 / tilt.to_radians().cos();
    let samples = synthetic(&SWEEP, move |t| k * planar(5.0, 3.0)(t));

    let calibrator = EucentricAxisCalibrator::default();
    let fit = calibrator
        .fit_model(&samples, EucentricModel::Tilted { tilt_deg: tilt })
        .expect("fit");
    assert_abs_diff_eq!(fit.y0, 5.0, epsilon = 1e-3);
    assert_abs_diff_eq!(fit.z0, 3.0, epsilon = 1e-3);

    let naive = calibrator.fit(&samples).expect("planar");
    assert_abs_diff_eq!(naive.z0, 3.0 * k, epsilon = 1e-3);
}

#[test]
fn model_selection_prefers_curved_when_r_term_present() {
    let angles: Vec<f64> = (4..=12).map(|i| i as f64 * 5.0).collect();
    let samples = synthetic(&angles, |t| 5.0 * (1.0 - t.cos()) + 3.0 * t.sin() + 2.0 * (1.0 - t.sin()));

    let calibrator = EucentricAxisCalibrator::default();
    let best = calibrator
        .fit_best(&samples, &[EucentricModel::Planar, EucentricModel::Curved])
        .expect("fit");
    assert_eq!(best.model, EucentricModel::Curved);
    assert!(best.r.is_some());
    assert!(best.residual_variance < 1e-12);
}

#[test]
fn model_selection_keeps_planar_for_planar_data() {
    let samples = synthetic(&SWEEP, planar(5.0, 3.0));
    let best = EucentricAxisCalibrator::default()
        .fit_best(&samples, &[EucentricModel::Planar, EucentricModel::Curved])
        .expect("fit");
    assert_eq!(best.model, EucentricModel::Planar);
}

#[test]
fn prediction_matches_baseline_corrected_curve() {
    let samples = synthetic(&SWEEP, planar(5.0, 3.0));
    let fit = EucentricAxisCalibrator::default().fit(&samples).expect("fit");
    let at = AngularPosition::from_degrees(12.5);
    assert_abs_diff_eq!(fit.predict(at), planar(5.0, 3.0)(at.radians()), epsilon = 1e-6);
}

#[test]
fn params_round_trip_through_json() {
    let params: CalibratorParams =
        serde_json::from_str(r#"{ "component": "x", "model": { "kind": "curved" } }"#).expect("params");
    assert_eq!(params.component, DisplacementComponent::X);
    assert_eq!(params.model, EucentricModel::Curved);
    assert_eq!(params.resample_step_deg, 0.1);
    assert_eq!(params.parameter_bound, 1e7);
}
