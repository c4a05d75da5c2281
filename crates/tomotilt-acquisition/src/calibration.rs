//! Eucentric calibration sweep.
//!
//! Tilt through a range, register every frame against the first one, fit
//! the rotation-axis offset and optionally move the specimen onto the axis.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tomotilt_core::{AngularPosition, DisplacementSample, Frame, LinearPosition, SweepDirection};
use tomotilt_eucentric::{AxisOffsetModel, EucentricAxisCalibrator, EucentricModel};
use tomotilt_registration::PatchCorrelationRegistrar;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::controller::step_count;
use crate::error::AcquisitionError;
use crate::imaging::{CaptureSettings, ImagingGateway};
use crate::positioner::{Axis, AxisPositions, PositionerError, PositionerGateway, Readout};

/// Sweep settings.
#[derive(Clone, Debug, PartialEq)]
pub struct EucentricCalibration {
    pub start: AngularPosition,
    pub end: AngularPosition,
    /// Positive step between captures.
    pub step: AngularPosition,
    pub capture: CaptureSettings,
    /// Move the stage and refocus after a successful fit.
    pub apply: bool,
    /// Multiplies the fitted offsets before they are applied.
    pub correction_sign: f64,
    /// Models to compare; empty fits the calibrator's configured model.
    pub candidates: Vec<EucentricModel>,
}

impl EucentricCalibration {
    pub fn new(start: AngularPosition, end: AngularPosition, step: AngularPosition, capture: CaptureSettings) -> Self {
        Self {
            start,
            end,
            step,
            capture,
            apply: false,
            correction_sign: -1.0,
            candidates: Vec::new(),
        }
    }

    pub fn with_apply(mut self, apply: bool) -> Self {
        self.apply = apply;
        self
    }

    pub fn with_candidates(mut self, candidates: Vec<EucentricModel>) -> Self {
        self.candidates = candidates;
        self
    }
}

/// What was changed on the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedCorrection {
    pub stage_y: LinearPosition,
    pub stage_z: LinearPosition,
    /// Working-distance change in meters.
    pub working_distance: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    pub model: AxisOffsetModel,
    pub samples: Vec<DisplacementSample>,
    pub applied: Option<AppliedCorrection>,
}

impl EucentricCalibration {
    /// Run the sweep, fit, and apply when enabled.
    ///
    /// The tilt is returned to where it started whether or not the sweep
    /// succeeds. Nothing is applied unless the fit succeeds.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip_all, fields(start = %self.start, end = %self.end, step = %self.step))
    )]
    pub fn run<P, G>(
        &self,
        positioner: &mut P,
        imaging: &mut G,
        registrar: &PatchCorrelationRegistrar,
        calibrator: &EucentricAxisCalibrator,
    ) -> Result<CalibrationOutcome, AcquisitionError>
    where
        P: PositionerGateway,
        G: ImagingGateway,
    {
        if !self.correction_sign.is_finite() {
            return Err(AcquisitionError::InvalidSettings(format!(
                "correction sign must be finite, got {}",
                self.correction_sign
            )));
        }
        let Some(total) = step_count(self.start, self.end, self.step) else {
            return Err(AcquisitionError::InvalidSettings(format!(
                "calibration step must be positive, got {}",
                self.step
            )));
        };
        let home = match positioner.read_position().tilt() {
            Readout::Known(angle) => angle,
            Readout::Unknown => return Err(PositionerError::UnknownPosition { axis: Axis::Tilt }.into()),
        };

        info!("calibration sweep {} -> {} ({} captures)", self.start, self.end, total);
        let swept = self.sweep(positioner, imaging, registrar, total);
        let returned = positioner.move_absolute(&AxisPositions::new().with_tilt(home));
        let samples = swept?;
        returned?;

        let model = if self.candidates.is_empty() {
            calibrator.fit(&samples)?
        } else {
            calibrator.fit_best(&samples, &self.candidates)?
        };
        info!(
            "axis offset ({}): y0 {:.4e} m, z0 {:.4e} m, rms {:.2e}",
            model.model.name(),
            model.y0,
            model.z0,
            model.rms_residual
        );

        let applied = if self.apply {
            Some(self.apply_model(positioner, imaging, &model)?)
        } else {
            None
        };
        Ok(CalibrationOutcome {
            model,
            samples,
            applied,
        })
    }

    fn sweep<P: PositionerGateway, G: ImagingGateway>(
        &self,
        positioner: &mut P,
        imaging: &mut G,
        registrar: &PatchCorrelationRegistrar,
        total: usize,
    ) -> Result<Vec<DisplacementSample>, AcquisitionError> {
        let direction = SweepDirection::between(self.start, self.end);
        let step = self.step * direction.sign();

        positioner.move_absolute(&AxisPositions::new().with_tilt(self.start))?;
        let reference: Frame = imaging.capture_frame(&self.capture)?;
        let mut samples = vec![DisplacementSample::new(self.start, 0.0, 0.0)];

        for k in 1..total {
            let mut angle = self.start + step * k as i64;
            angle = match direction {
                SweepDirection::Ascending => angle.min(self.end),
                SweepDirection::Descending => angle.max(self.end),
            };
            positioner.move_absolute(&AxisPositions::new().with_tilt(angle))?;
            let frame = imaging.capture_frame(&self.capture)?;
            match registrar.register(&reference, &frame) {
                Ok(r) if !r.is_low_confidence() => {
                    debug!("{angle}: {:+.2}, {:+.2} px (conf {:.2})", r.dx_px, r.dy_px, r.confidence);
                    samples.push(DisplacementSample::new(angle, r.dx, r.dy));
                }
                Ok(_) => warn!("{angle}: low-confidence registration skipped"),
                Err(err) => warn!("{angle}: registration failed ({err}); sample skipped"),
            }
        }
        Ok(samples)
    }

    fn apply_model<P: PositionerGateway, G: ImagingGateway>(
        &self,
        positioner: &mut P,
        imaging: &mut G,
        model: &AxisOffsetModel,
    ) -> Result<AppliedCorrection, AcquisitionError> {
        let sign = self.correction_sign;
        let applied = AppliedCorrection {
            stage_y: LinearPosition::from_meters(sign * model.y0_along_sweep()),
            stage_z: LinearPosition::from_meters(sign * model.z0),
            working_distance: sign * model.z0,
        };
        positioner.move_relative(
            &AxisPositions::new()
                .with_linear(Axis::Z, applied.stage_z)
                .with_linear(Axis::Y, applied.stage_y),
        )?;
        let wd = imaging.working_distance()?;
        imaging.set_working_distance(wd + applied.working_distance)?;
        info!(
            "applied stage Y {}, Z {}, working distance {:+.3e} m",
            applied.stage_y, applied.stage_z, applied.working_distance
        );
        Ok(applied)
    }
}
