use serde::{Deserialize, Serialize};

use crate::AngularPosition;

/// Drift measured at one tilt angle.
///
/// `dx`/`dy` are in meters when produced by the acquisition loop; the
/// calibrator is unit-agnostic and reports the fitted offsets in whatever
/// unit the samples carry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplacementSample {
    pub angle: AngularPosition,
    pub dx: f64,
    pub dy: f64,
}

impl DisplacementSample {
    pub fn new(angle: AngularPosition, dx: f64, dy: f64) -> Self {
        Self { angle, dx, dy }
    }

    pub fn component(&self, component: DisplacementComponent) -> f64 {
        match component {
            DisplacementComponent::X => self.dx,
            DisplacementComponent::Y => self.dy,
        }
    }
}

/// Which image axis of a [`DisplacementSample`] to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplacementComponent {
    X,
    #[default]
    Y,
}

/// Order in which a sweep traversed the tilt axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepDirection {
    #[default]
    Ascending,
    Descending,
}

impl SweepDirection {
    /// `+1` for ascending sweeps, `-1` for descending ones.
    pub fn sign(self) -> i64 {
        match self {
            SweepDirection::Ascending => 1,
            SweepDirection::Descending => -1,
        }
    }

    /// Direction of travel from `from` towards `to`; ties count as ascending.
    pub fn between(from: AngularPosition, to: AngularPosition) -> Self {
        if to < from {
            SweepDirection::Descending
        } else {
            SweepDirection::Ascending
        }
    }

    /// Direction in which `samples` were captured.
    ///
    /// Only the first and last angles are compared; the sequence is expected
    /// to be monotone.
    pub fn of_sequence(samples: &[DisplacementSample]) -> Self {
        match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => Self::between(first.angle, last.angle),
            _ => SweepDirection::Ascending,
        }
    }
}
