use log::debug;
use nalgebra::Vector2;
use tomotilt_registration::RegistrationResult;

use crate::imaging::BeamShift;

/// Largest gain for which the anticipating loop stays stable.
pub const MAX_STABLE_ANTICIPATING_GAIN: f64 = 2.0 / 3.0;

/// Turns frame-to-frame drift into beam-shift increments.
///
/// Each confident measurement `d` yields `c = −gain·d`. With anticipation
/// the loop also keeps a running sum `a += c` and emits `c + a`, so a steady
/// per-step drift is learned and fed forward. With `d` measured between
/// consecutive frames the residual follows
/// `e[k+1] = (1 − 2g)·e[k] + g·e[k−1]`, which converges for
/// `0 < g < 2/3`.
#[derive(Clone, Debug, PartialEq)]
pub struct DriftCorrectionLoop {
    anticipation_enabled: bool,
    gain: f64,
    anticipation: BeamShift,
}

impl DriftCorrectionLoop {
    pub fn new(anticipation_enabled: bool, gain: f64) -> Self {
        Self {
            anticipation_enabled,
            gain,
            anticipation: Vector2::zeros(),
        }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }

    pub fn anticipation(&self) -> BeamShift {
        self.anticipation
    }

    /// Beam-shift increment for one registration, `None` when it is not
    /// confident enough to act on.
    pub fn update(&mut self, measured: &RegistrationResult) -> Option<BeamShift> {
        if measured.is_low_confidence() {
            debug!("low-confidence registration, no correction");
            return None;
        }
        let correction = -self.gain * Vector2::new(measured.dx, measured.dy);
        if !self.anticipation_enabled {
            return Some(correction);
        }
        self.anticipation += correction;
        Some(correction + self.anticipation)
    }

    pub fn reset(&mut self) {
        self.anticipation = Vector2::zeros();
    }
}
