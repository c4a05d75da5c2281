use tomotilt_acquisition::sim::{SimulatedMicroscope, SimulatedStage};
use tomotilt_acquisition::{
    AcquisitionError, Axis, AxisLimits, CaptureSettings, EucentricCalibration, ImagingGateway, PositionerError,
    Resolution,
};
use tomotilt_core::{AngularPosition, BitDepth, LinearPosition};
use tomotilt_eucentric::{CalibrationError, EucentricAxisCalibrator, EucentricModel};
use tomotilt_registration::{PatchCorrelationRegistrar, RegistrationParams};

const SIZE: usize = 96;
const SCALE: f64 = 1e-7;
const Y_OFFSET: f64 = 2e-5;
const Z_OFFSET: f64 = 3e-6;

fn deg(d: f64) -> AngularPosition {
    AngularPosition::from_degrees(d)
}

fn capture() -> CaptureSettings {
    CaptureSettings {
        resolution: Resolution::new(SIZE, SIZE),
        dwell_time: 1e-6,
        bit_depth: BitDepth::Sixteen,
        hfw: SIZE as f64 * SCALE,
    }
}

fn registrar() -> PatchCorrelationRegistrar {
    PatchCorrelationRegistrar::new(RegistrationParams {
        grid_size: 3,
        template_ratio: 0.5,
        max_shift: Some(28),
        subpixel: true,
        ..RegistrationParams::default()
    })
}

fn sweep(start: f64, end: f64, step: f64) -> EucentricCalibration {
    EucentricCalibration::new(deg(start), deg(end), deg(step), capture())
}

fn assert_close(got: f64, want: f64, rel: f64) {
    assert!((got - want).abs() <= rel * want.abs(), "got {got:e}, want {want:e}");
}

#[test]
fn sweep_recovers_axis_offset_and_returns_home() {
    let stage = SimulatedStage::new().with_eucentric_offset(Y_OFFSET, Z_OFFSET);
    let mut positioner = stage.positioner(AxisLimits::default());
    let mut scope = SimulatedMicroscope::new(stage.clone(), 21);

    let outcome = sweep(-20.0, 20.0, 5.0)
        .run(&mut positioner, &mut scope, &registrar(), &EucentricAxisCalibrator::default())
        .expect("calibration");

    assert_eq!(outcome.samples.len(), 9);
    assert_eq!(outcome.samples[0].angle, deg(-20.0));
    assert_close(outcome.model.y0, Y_OFFSET, 0.15);
    assert_close(outcome.model.z0, Z_OFFSET, 0.15);
    assert!(outcome.applied.is_none());
    assert_eq!(stage.raw(Axis::Tilt), 0);
    assert_eq!(stage.eucentric_offset(), (Y_OFFSET, Z_OFFSET));
}

#[test]
fn applying_the_fit_moves_the_specimen_onto_the_axis() {
    let stage = SimulatedStage::new().with_eucentric_offset(Y_OFFSET, Z_OFFSET);
    let mut positioner = stage.positioner(AxisLimits::default());
    let mut scope = SimulatedMicroscope::new(stage.clone(), 21);
    let wd_before = scope.working_distance().unwrap();

    let outcome = sweep(-20.0, 20.0, 5.0)
        .with_apply(true)
        .run(&mut positioner, &mut scope, &registrar(), &EucentricAxisCalibrator::default())
        .expect("calibration");

    let applied = outcome.applied.expect("applied");
    assert_eq!(applied.stage_z, LinearPosition::from_meters(-outcome.model.z0));
    assert_eq!(applied.stage_y, LinearPosition::from_meters(-outcome.model.y0));

    let (y, z) = stage.eucentric_offset();
    assert!(y.abs() < 0.15 * Y_OFFSET, "residual y {y:e}");
    assert!(z.abs() < 0.15 * Z_OFFSET, "residual z {z:e}");
    let wd_after = scope.working_distance().unwrap();
    assert!((wd_after - (wd_before - outcome.model.z0)).abs() < 1e-15);
}

#[test]
fn model_candidates_are_compared() {
    let stage = SimulatedStage::new().with_eucentric_offset(Y_OFFSET, Z_OFFSET);
    let mut positioner = stage.positioner(AxisLimits::default());
    let mut scope = SimulatedMicroscope::new(stage.clone(), 5);

    let outcome = sweep(-20.0, 20.0, 5.0)
        .with_candidates(vec![EucentricModel::Planar, EucentricModel::Curved])
        .run(&mut positioner, &mut scope, &registrar(), &EucentricAxisCalibrator::default())
        .expect("calibration");
    assert!(matches!(outcome.model.model, EucentricModel::Planar | EucentricModel::Curved));
}

#[test]
fn failed_fit_applies_nothing() {
    let stage = SimulatedStage::new().with_eucentric_offset(Y_OFFSET, Z_OFFSET);
    let mut positioner = stage.positioner(AxisLimits::default());
    let mut scope = SimulatedMicroscope::new(stage.clone(), 21);
    let wd_before = scope.working_distance().unwrap();

    let err = sweep(0.0, 5.0, 5.0)
        .with_apply(true)
        .run(&mut positioner, &mut scope, &registrar(), &EucentricAxisCalibrator::default())
        .expect_err("two angles cannot be fitted");
    assert!(matches!(
        err,
        AcquisitionError::Calibration(CalibrationError::InsufficientData { got: 2, need: 3 })
    ));
    assert_eq!(stage.eucentric_offset(), (Y_OFFSET, Z_OFFSET));
    assert_eq!(scope.working_distance().unwrap(), wd_before);
    assert_eq!(stage.raw(Axis::Tilt), 0);
}

#[test]
fn out_of_range_start_moves_nothing() {
    let stage = SimulatedStage::new();
    let mut positioner = stage.positioner(AxisLimits::default());
    let mut scope = SimulatedMicroscope::new(stage.clone(), 1);

    let err = sweep(-80.0, 0.0, 5.0)
        .run(&mut positioner, &mut scope, &registrar(), &EucentricAxisCalibrator::default())
        .expect_err("-80° is outside the tilt range");
    assert!(matches!(
        err,
        AcquisitionError::Positioner(PositionerError::OutOfRange { axis: Axis::Tilt, .. })
    ));
    assert_eq!(scope.captures(), 0);
}
