//! Core types and utilities for closed-loop tilt-series acquisition.
//!
//! This crate is intentionally small. It does *not* depend on any concrete
//! microscope client, image codec or solver: it only defines the frame
//! buffer, the hardware-native position units and the displacement samples
//! that flow between the registration, calibration and acquisition crates.

mod frame;
mod logger;
mod sample;
mod units;

pub use frame::{BitDepth, Frame, FrameError, FrameView};
pub use sample::{DisplacementComponent, DisplacementSample, SweepDirection};
pub use units::{AngularPosition, LinearPosition};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
