use serde::{Deserialize, Serialize};

use super::RegistrationError;

/// Default per-patch search radius, pixels.
pub const DEFAULT_MAX_SHIFT: usize = 32;

/// Configuration for [`PatchCorrelationRegistrar`](super::PatchCorrelationRegistrar).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    /// Patches per side of the template grid.
    pub grid_size: usize,
    /// Fraction of each frame dimension covered by the centered template.
    pub template_ratio: f64,
    /// Largest shift searched per patch, in pixels.
    ///
    /// Defaults to [`DEFAULT_MAX_SHIFT`]. `None` (`null` in JSON) searches the
    /// whole target frame, which costs `O(W·H·patch)` per patch.
    pub max_shift: Option<usize>,
    /// Outlier-rejection passes (stops early once stable).
    pub outlier_passes: usize,
    /// Fewest surviving patches for a result to count as confident.
    pub min_patches: usize,
    /// Refine each NCC peak with a parabolic fit.
    pub subpixel: bool,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            grid_size: 4,
            template_ratio: 0.5,
            max_shift: Some(DEFAULT_MAX_SHIFT),
            outlier_passes: 2,
            min_patches: 1,
            subpixel: false,
        }
    }
}

impl RegistrationParams {
    /// Parameters with a given grid and template ratio, defaults otherwise.
    pub fn with_grid(grid_size: usize, template_ratio: f64) -> Self {
        Self {
            grid_size,
            template_ratio,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.grid_size == 0 {
            return Err(RegistrationError::InvalidGridSize);
        }
        if !(self.template_ratio > 0.0 && self.template_ratio <= 1.0) {
            return Err(RegistrationError::InvalidTemplateRatio(self.template_ratio));
        }
        Ok(())
    }
}
