use serde::{Deserialize, Serialize};

/// Displacement of one patch, in pixels, with its NCC peak as confidence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrelationResult {
    pub dx: f64,
    pub dy: f64,
    /// Peak NCC clamped to [0, 1].
    pub confidence: f64,
}

/// Output of a registration run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationResult {
    /// Displacement in meters (`pixels * hfw / width`).
    pub dx: f64,
    pub dy: f64,
    /// Displacement in pixels.
    pub dx_px: f64,
    pub dy_px: f64,
    /// Mean confidence of the surviving patches; 0 when nothing survived.
    pub confidence: f64,
    pub patches_total: usize,
    pub patches_used: usize,
}

impl RegistrationResult {
    /// The "no correction this step" result.
    pub fn low_confidence(patches_total: usize) -> Self {
        Self {
            dx: 0.0,
            dy: 0.0,
            dx_px: 0.0,
            dy_px: 0.0,
            confidence: 0.0,
            patches_total,
            patches_used: 0,
        }
    }

    #[inline]
    pub fn is_low_confidence(&self) -> bool {
        self.confidence <= 0.0
    }
}
