//! Closed-loop tilt-series acquisition.
//!
//! The crate is organised around two hardware seams:
//!
//! - [`PositionerGateway`] moves the specimen stage and blocks until it has
//!   settled. [`BoundedPositioner`] implements it on top of a raw
//!   [`PositionerDriver`], refusing out-of-range targets before anything
//!   moves.
//! - [`ImagingGateway`] captures frames and exposes the beam shift and the
//!   working distance. The controller and any dithering task share it
//!   through a [`BeamShiftActuator`].
//!
//! [`TiltSeriesController`] drives a series: capture, register against the
//! previous frame, correct the beam shift through a [`DriftCorrectionLoop`],
//! advance the tilt. [`EucentricCalibration`] sweeps the tilt, fits the
//! rotation-axis offset and can move the specimen onto the axis.
//!
//! The [`sim`] module provides a simulated stage and microscope used by the
//! tests and the `simulate` command.

mod calibration;
mod clock;
mod config;
mod controller;
mod dither;
mod drift;
mod error;
mod focus;
mod handshake;
mod imaging;
mod positioner;
pub mod sim;

pub use calibration::{AppliedCorrection, CalibrationOutcome, EucentricCalibration};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AcquisitionConfig, ConfigError};
pub use controller::{step_count, AcquisitionReport, ControllerState, SeriesSettings, TiltSeriesController};
pub use dither::{DitherConfig, DitherKind, DitherMode, DitherStats, FreeDither, InterleavedProbe};
pub use drift::{DriftCorrectionLoop, MAX_STABLE_ANTICIPATING_GAIN};
pub use error::AcquisitionError;
pub use focus::{FocusAdaptation, ModelFocusTracker};
pub use handshake::{CancellationToken, Turn, TurnHandshake};
pub use imaging::{
    BeamShift, BeamShiftActuator, CaptureSettings, FrameMeta, FrameSink, ImagingError, ImagingGateway, Resolution,
};
pub use positioner::{
    Axis, AxisLimits, AxisPositions, BoundedPositioner, DriverError, Limit, PositionReadout, PositionerDriver,
    PositionerError, PositionerGateway, Readout, DEFAULT_POLL_INTERVAL, DEFAULT_SETTLE_TIMEOUT,
};
