use serde::{Deserialize, Serialize};

use crate::CalibrationError;

/// Rotation-offset model fitted to a drift curve.
///
/// Every form is linear in its parameters; the order is always `y, z[, r]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EucentricModel {
    /// `y·(1 − cos θ) + z·sin θ`
    #[default]
    Planar,
    /// `y·(1 − cos θ) + z·sin θ + r·(1 − sin θ)`
    Curved,
    /// Planar drift observed through a detector tilted by `tilt_deg`:
    /// `(y·(1 − cos θ) + z·sin θ) / cos t`.
    Tilted { tilt_deg: f64 },
}

impl EucentricModel {
    pub fn param_count(&self) -> usize {
        match self {
            EucentricModel::Curved => 3,
            EucentricModel::Planar | EucentricModel::Tilted { .. } => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EucentricModel::Planar => "planar",
            EucentricModel::Curved => "curved",
            EucentricModel::Tilted { .. } => "tilted",
        }
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if let EucentricModel::Tilted { tilt_deg } = *self {
            if !tilt_deg.is_finite() || tilt_deg.abs() >= 90.0 {
                return Err(CalibrationError::InvalidModel(format!(
                    "viewing tilt must lie in (-90, 90) degrees, got {tilt_deg}"
                )));
            }
        }
        Ok(())
    }

    /// Partial derivatives with respect to `y, z[, r]` at `theta` (radians).
    ///
    /// Since the model is linear these are also its basis functions.
    pub fn basis(&self, theta: f64, out: &mut [f64]) {
        let (s, c) = theta.sin_cos();
        match *self {
            EucentricModel::Planar => {
                out[0] = 1.0 - c;
                out[1] = s;
            }
            EucentricModel::Curved => {
                out[0] = 1.0 - c;
                out[1] = s;
                out[2] = 1.0 - s;
            }
            EucentricModel::Tilted { tilt_deg } => {
                let k = 1.0 / tilt_deg.to_radians().cos();
                out[0] = (1.0 - c) * k;
                out[1] = s * k;
            }
        }
    }

    /// Model value at `theta` (radians) for parameters `params`.
    pub fn evaluate(&self, theta: f64, params: &[f64]) -> f64 {
        let mut b = [0.0; 3];
        self.basis(theta, &mut b);
        b.iter().zip(params).map(|(b, p)| b * p).sum()
    }
}
