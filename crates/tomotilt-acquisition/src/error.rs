use tomotilt_core::AngularPosition;
use tomotilt_eucentric::CalibrationError;
use tomotilt_registration::RegistrationError;

use crate::config::ConfigError;
use crate::imaging::ImagingError;
use crate::positioner::PositionerError;

#[derive(thiserror::Error, Debug)]
pub enum AcquisitionError {
    /// The run stopped on an unrecoverable error.
    #[error("acquisition faulted (last good step {}, at {}): {source}", fmt_step(*last_good_step), fmt_angle(*last_angle))]
    Faulted {
        last_good_step: Option<usize>,
        last_angle: Option<AngularPosition>,
        #[source]
        source: Box<AcquisitionError>,
    },
    #[error(transparent)]
    Positioner(#[from] PositionerError),
    #[error(transparent)]
    Imaging(#[from] ImagingError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("dithering task failed: {0}")]
    Dither(String),
}

fn fmt_step(step: Option<usize>) -> String {
    step.map_or_else(|| "none".to_string(), |s| s.to_string())
}

fn fmt_angle(angle: Option<AngularPosition>) -> String {
    angle.map_or_else(|| "unknown angle".to_string(), |a| a.to_string())
}

impl AcquisitionError {
    /// Innermost cause of a fault.
    pub fn root(&self) -> &AcquisitionError {
        match self {
            AcquisitionError::Faulted { source, .. } => source.root(),
            other => other,
        }
    }
}
