use log::debug;
use tomotilt_core::Frame;

#[cfg(feature = "tracing")]
use tracing::instrument;

use super::{CorrelationResult, RegistrationError, RegistrationParams, RegistrationResult};
use crate::filter::{aggregate, filter_outliers};
use crate::ncc::{locate_patch, PixelRect};

/// Grid-of-patches NCC registrar.
#[derive(Clone, Debug, Default)]
pub struct PatchCorrelationRegistrar {
    params: RegistrationParams,
}

impl PatchCorrelationRegistrar {
    pub fn new(params: RegistrationParams) -> Self {
        Self { params }
    }

    #[inline]
    pub fn params(&self) -> &RegistrationParams {
        &self.params
    }

    /// One-shot registration with an explicit grid and template ratio.
    ///
    /// Equivalent to building a registrar with
    /// [`RegistrationParams::with_grid`] and calling [`register`](Self::register).
    pub fn match_frames(
        reference: &Frame,
        target: &Frame,
        grid_size: usize,
        template_ratio: f64,
    ) -> Result<RegistrationResult, RegistrationError> {
        Self::new(RegistrationParams::with_grid(grid_size, template_ratio)).register(reference, target)
    }

    /// Displacement of `target` relative to `reference`.
    ///
    /// Each patch contributes `patch_origin - peak_location`; the aggregate
    /// is converted to meters with the reference frame's scale. Flat or
    /// untrackable frames return [`RegistrationResult::low_confidence`].
    #[cfg_attr(
        feature = "tracing",
        instrument(
            level = "debug",
            skip(self, reference, target),
            fields(width = reference.width(), height = reference.height(), grid = self.params.grid_size)
        )
    )]
    pub fn register(&self, reference: &Frame, target: &Frame) -> Result<RegistrationResult, RegistrationError> {
        self.params.validate()?;
        if !reference.same_dimensions(target) {
            return Err(RegistrationError::SizeMismatch {
                reference: (reference.width(), reference.height()),
                target: (target.width(), target.height()),
            });
        }

        let patches = self.patch_grid(reference.width(), reference.height())?;
        let ref_view = reference.view();
        let tgt_view = target.view();

        let vectors: Vec<CorrelationResult> = patches
            .iter()
            .filter_map(|&rect| {
                let peak = locate_patch(&ref_view, &tgt_view, rect, self.params.max_shift, self.params.subpixel)?;
                Some(CorrelationResult {
                    dx: rect.x as f64 - peak.x,
                    dy: rect.y as f64 - peak.y,
                    confidence: peak.score.clamp(0.0, 1.0),
                })
            })
            .collect();

        if vectors.is_empty() {
            debug!("no patch produced a displacement ({} patches)", patches.len());
            return Ok(RegistrationResult::low_confidence(patches.len()));
        }

        let kept = filter_outliers(&vectors, self.params.outlier_passes);
        if kept.len() < self.params.min_patches.max(1) {
            debug!(
                "{} of {} patches survived filtering, need {}",
                kept.len(),
                patches.len(),
                self.params.min_patches
            );
            return Ok(RegistrationResult::low_confidence(patches.len()));
        }

        Ok(summarize(&kept, patches.len(), reference.scale()))
    }

    /// Non-overlapping patches tiling the centered template, row-major.
    fn patch_grid(&self, width: usize, height: usize) -> Result<Vec<PixelRect>, RegistrationError> {
        let grid = self.params.grid_size;
        let template_w = (width as f64 * self.params.template_ratio).floor() as usize;
        let template_h = (height as f64 * self.params.template_ratio).floor() as usize;
        let pw = template_w / grid;
        let ph = template_h / grid;
        if pw == 0 || ph == 0 {
            return Err(RegistrationError::PatchTooSmall {
                grid_size: grid,
                template_w,
                template_h,
            });
        }

        let x0 = (width - pw * grid) / 2;
        let y0 = (height - ph * grid) / 2;
        let mut rects = Vec::with_capacity(grid * grid);
        for j in 0..grid {
            for i in 0..grid {
                rects.push(PixelRect {
                    x: x0 + i * pw,
                    y: y0 + j * ph,
                    w: pw,
                    h: ph,
                });
            }
        }
        Ok(rects)
    }
}

/// Aggregate the surviving patches into one result in meters.
///
/// Survivors whose peaks all clamp to zero confidence carry no usable
/// displacement and yield [`RegistrationResult::low_confidence`].
fn summarize(kept: &[CorrelationResult], patches_total: usize, scale: f64) -> RegistrationResult {
    let (dx_px, dy_px, confidence) = aggregate(kept);
    if confidence <= 0.0 {
        debug!("{} patches survived but none correlated positively", kept.len());
        return RegistrationResult::low_confidence(patches_total);
    }
    debug!(
        "registered {:.3},{:.3} px from {}/{} patches (confidence {:.3})",
        dx_px,
        dy_px,
        kept.len(),
        patches_total,
        confidence
    );

    RegistrationResult {
        dx: dx_px * scale,
        dy: dy_px * scale,
        dx_px,
        dy_px,
        confidence,
        patches_total,
        patches_used: kept.len(),
    }
}
