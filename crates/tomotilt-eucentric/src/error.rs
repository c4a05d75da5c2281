/// Reasons a calibration produces no model.
///
/// Neither case leaves partial state behind; callers apply nothing.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("need at least {need} distinct tilt angles, got {got}")]
    InsufficientData { got: usize, need: usize },
    #[error("fit diverged after {iterations} iterations: {reason}")]
    FitDivergence { reason: String, iterations: usize },
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("sample at {angle_deg} deg is not finite")]
    NonFiniteSample { angle_deg: f64 },
}
