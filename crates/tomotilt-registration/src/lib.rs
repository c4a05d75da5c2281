//! Frame-to-frame drift estimation by patch-grid normalized cross-correlation.
//!
//! ## Quickstart
//!
//! ```no_run
//! use tomotilt_core::Frame;
//! use tomotilt_registration::{PatchCorrelationRegistrar, RegistrationParams};
//!
//! # fn run(previous: &Frame, current: &Frame) -> Result<(), tomotilt_registration::RegistrationError> {
//! let registrar = PatchCorrelationRegistrar::new(RegistrationParams {
//!     grid_size: 4,
//!     template_ratio: 0.5,
//!     max_shift: Some(64),
//!     ..RegistrationParams::default()
//! });
//! let drift = registrar.register(previous, current)?;
//! if !drift.is_low_confidence() {
//!     println!("drift: {:.3e} m, {:.3e} m", drift.dx, drift.dy);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Registering a frame against itself is a no-op: every patch peaks at its
//! own origin, and ties are resolved toward zero shift.

mod filter;
mod ncc;
mod registrar;

pub use filter::{box_smooth, filter_outliers, smoothing_kernel};
pub use registrar::{
    CorrelationResult, PatchCorrelationRegistrar, RegistrationError, RegistrationParams,
    RegistrationResult, DEFAULT_MAX_SHIFT,
};
