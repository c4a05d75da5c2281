//! Patch-grid registration pipeline.
//!
//! A centered template region of the reference is split into a square grid
//! of patches. Each patch is located in the target by NCC, the per-patch
//! displacements are outlier-filtered and smoothed, and the survivors are
//! averaged into one displacement in physical units.

mod error;
mod params;
mod pipeline;
mod result;

pub use error::RegistrationError;
pub use params::{RegistrationParams, DEFAULT_MAX_SHIFT};
pub use pipeline::PatchCorrelationRegistrar;
pub use result::{CorrelationResult, RegistrationResult};
