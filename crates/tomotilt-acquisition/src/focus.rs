use tomotilt_core::AngularPosition;
use tomotilt_eucentric::AxisOffsetModel;

/// Focus follow-up hook run in the correction slot of each step.
pub trait FocusAdaptation {
    /// Working-distance change (meters) to apply when the stage goes from
    /// `from` to `to`; `None` leaves focus alone.
    fn working_distance_delta(&mut self, from: AngularPosition, to: AngularPosition) -> Option<f64>;
}

/// Predicts defocus from a fitted eucentric offset.
///
/// Tilting by `θ` moves the imaged point along the beam by
/// `z0·(1 − cos θ) − y0·sin θ`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelFocusTracker {
    y0: f64,
    z0: f64,
}

impl ModelFocusTracker {
    pub fn new(y0: f64, z0: f64) -> Self {
        Self { y0, z0 }
    }

    /// Use the direction-normalized offsets of `model`.
    pub fn from_model(model: &AxisOffsetModel) -> Self {
        Self::new(model.y0_along_sweep(), model.z0)
    }

    pub fn predicted(&self, angle: AngularPosition) -> f64 {
        let (s, c) = angle.radians().sin_cos();
        self.z0 * (1.0 - c) - self.y0 * s
    }
}

impl FocusAdaptation for ModelFocusTracker {
    fn working_distance_delta(&mut self, from: AngularPosition, to: AngularPosition) -> Option<f64> {
        let delta = self.predicted(to) - self.predicted(from);
        (delta != 0.0).then_some(delta)
    }
}
