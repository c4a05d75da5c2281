//! Facade crate for the `tomotilt-*` workspace.
//!
//! This crate provides:
//! - stable re-exports of the registration, calibration and acquisition
//!   crates
//! - (feature `image`) PNG loading and a directory [`FrameSink`](acquisition::FrameSink)
//! - (feature `cli`) the `tomotilt` command-line tool
//!
//! ## Quickstart
//!
//! ```no_run
//! use tomotilt::acquisition::sim::{SimulatedMicroscope, SimulatedStage};
//! use tomotilt::acquisition::{AcquisitionConfig, AxisLimits, TiltSeriesController};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AcquisitionConfig::from_path("series.json")?;
//! let stage = SimulatedStage::new().with_eucentric_offset(5e-6, 3e-6);
//! let positioner = stage.positioner(AxisLimits::default());
//! let scope = SimulatedMicroscope::new(stage.clone(), 7);
//!
//! let mut controller = TiltSeriesController::from_config(positioner, scope, &config);
//! let report = controller.run()?;
//! println!("{} frames, {} corrections", report.steps_completed, report.corrections.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `tomotilt::core`: frames, hardware position units, displacement samples, logging.
//! - `tomotilt::registration`: patch-grid NCC drift registration.
//! - `tomotilt::eucentric`: rotation-axis offset fitting.
//! - `tomotilt::acquisition`: gateways, drift loop, controller, calibration sweep, simulator.
//! - `tomotilt::io` (feature `image`): PNG frames on disk.

pub use tomotilt_acquisition as acquisition;
pub use tomotilt_core as core;
pub use tomotilt_eucentric as eucentric;
pub use tomotilt_registration as registration;

pub use tomotilt_acquisition::{AcquisitionConfig, AcquisitionReport, EucentricCalibration, TiltSeriesController};
pub use tomotilt_core::{AngularPosition, DisplacementSample, Frame};
pub use tomotilt_eucentric::{AxisOffsetModel, EucentricAxisCalibrator};
pub use tomotilt_registration::{PatchCorrelationRegistrar, RegistrationResult};

#[cfg(feature = "image")]
pub mod io;
