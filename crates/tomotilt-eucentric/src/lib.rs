//! Eucentric rotation-axis calibration.
//!
//! While a specimen is tilted about an axis that does not pass through the
//! imaged point, the image drifts along
//! `d(θ) = y·(1 − cos θ) + z·sin θ`, where `(y, z)` is the offset of the
//! axis from the point. [`EucentricAxisCalibrator`] recovers that offset from
//! a sampled drift curve:
//!
//! 1. sort ascending, remember the traversal direction, subtract the
//!    displacement nearest to 0°;
//! 2. densify with a monotone cubic interpolant;
//! 3. bounded Levenberg–Marquardt from a zero guess, then a polish on the
//!    raw samples.
//!
//! ```
//! use tomotilt_core::{AngularPosition, DisplacementSample};
//! use tomotilt_eucentric::EucentricAxisCalibrator;
//!
//! let samples: Vec<_> = [-10.0f64, -5.0, 0.0, 5.0, 10.0, 15.0, 20.0]
//!     .iter()
//!     .map(|&deg| {
//!         let t = deg.to_radians();
//!         DisplacementSample::new(AngularPosition::from_degrees(deg), 0.0, 5.0 * (1.0 - t.cos()) + 3.0 * t.sin())
//!     })
//!     .collect();
//!
//! let fit = EucentricAxisCalibrator::default().fit(&samples).unwrap();
//! assert!((fit.y0 - 5.0).abs() < 1e-3);
//! assert!((fit.z0 - 3.0).abs() < 1e-3);
//! ```

mod calibrator;
mod error;
mod interp;
mod lm;
mod model;

pub use calibrator::{AxisOffsetModel, CalibratorParams, EucentricAxisCalibrator, FitStage, MIN_DISTINCT_ANGLES};
pub use error::CalibrationError;
pub use interp::MonotoneCubic;
pub use model::EucentricModel;
