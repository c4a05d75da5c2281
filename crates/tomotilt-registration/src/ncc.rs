//! Zero-mean normalized cross-correlation of one patch against a search window.

use tomotilt_core::FrameView;

/// Ties closer than this are broken toward the smaller shift.
const TIE_EPS: f64 = 1e-12;
/// Below this variance a patch or window carries no usable texture.
const MIN_VARIANCE: f64 = 1e-9;
/// Scores this close to 1 are exact matches; interpolation cannot improve them.
const PERFECT_SCORE: f64 = 1.0 - 1e-9;

/// Axis-aligned pixel rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

/// Best placement of a reference patch inside the target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PatchPeak {
    /// Top-left corner of the best window in the target, sub-pixel when refined.
    pub x: f64,
    pub y: f64,
    /// Peak NCC score in [-1, 1].
    pub score: f64,
}

struct CenteredPatch {
    values: Vec<f64>,
    norm_sq: f64,
}

fn centered_patch(src: &FrameView<'_>, rect: PixelRect) -> Option<CenteredPatch> {
    let n = (rect.w * rect.h) as f64;
    let mut values = Vec::with_capacity(rect.w * rect.h);
    let mut sum = 0.0;
    for y in rect.y..rect.y + rect.h {
        let row = &src.data[y * src.width + rect.x..y * src.width + rect.x + rect.w];
        for &v in row {
            let v = v as f64;
            sum += v;
            values.push(v);
        }
    }
    let mean = sum / n;
    let mut norm_sq = 0.0;
    for v in &mut values {
        *v -= mean;
        norm_sq += *v * *v;
    }
    if norm_sq / n < MIN_VARIANCE {
        return None;
    }
    Some(CenteredPatch { values, norm_sq })
}

fn score_at(target: &FrameView<'_>, patch: &CenteredPatch, rect: PixelRect, tx: usize, ty: usize) -> Option<f64> {
    let n = (rect.w * rect.h) as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut cross = 0.0;
    let mut k = 0;
    for y in ty..ty + rect.h {
        let row = &target.data[y * target.width + tx..y * target.width + tx + rect.w];
        for &v in row {
            let v = v as f64;
            sum += v;
            sum_sq += v * v;
            // The patch is zero-mean, so the window mean drops out of the cross term.
            cross += v * patch.values[k];
            k += 1;
        }
    }
    let var = sum_sq - sum * sum / n;
    if var / n < MIN_VARIANCE {
        return None;
    }
    Some(cross / (var * patch.norm_sq).sqrt())
}

/// Inclusive range of top-left positions that keep the patch inside `len`.
fn search_range(origin: usize, size: usize, len: usize, max_shift: Option<usize>) -> (usize, usize) {
    let last = len - size;
    match max_shift {
        None => (0, last),
        Some(r) => (origin.saturating_sub(r), (origin + r).min(last)),
    }
}

/// Parabolic vertex offset from three samples around a maximum.
fn parabolic_offset(left: f64, center: f64, right: f64) -> f64 {
    let denom = left - 2.0 * center + right;
    if denom >= -TIE_EPS {
        return 0.0;
    }
    (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
}

/// Locate `rect` of `reference` inside `target`.
///
/// Returns `None` when the patch is flat or no window in the search range
/// has usable variance.
pub(crate) fn locate_patch(
    reference: &FrameView<'_>,
    target: &FrameView<'_>,
    rect: PixelRect,
    max_shift: Option<usize>,
    subpixel: bool,
) -> Option<PatchPeak> {
    let patch = centered_patch(reference, rect)?;
    let (x_lo, x_hi) = search_range(rect.x, rect.w, target.width, max_shift);
    let (y_lo, y_hi) = search_range(rect.y, rect.h, target.height, max_shift);

    let cols = x_hi - x_lo + 1;
    let rows = y_hi - y_lo + 1;
    let mut scores = vec![f64::NAN; cols * rows];

    let mut best: Option<(usize, usize, f64, i64)> = None;
    for ty in y_lo..=y_hi {
        for tx in x_lo..=x_hi {
            let Some(score) = score_at(target, &patch, rect, tx, ty) else {
                continue;
            };
            scores[(ty - y_lo) * cols + (tx - x_lo)] = score;

            let dx = tx as i64 - rect.x as i64;
            let dy = ty as i64 - rect.y as i64;
            let dist = dx * dx + dy * dy;
            let better = match best {
                None => true,
                Some((_, _, s, d)) => score > s + TIE_EPS || ((score - s).abs() <= TIE_EPS && dist < d),
            };
            if better {
                best = Some((tx, ty, score, dist));
            }
        }
    }

    let (bx, by, score, _) = best?;
    let mut x = bx as f64;
    let mut y = by as f64;

    if subpixel && score < PERFECT_SCORE {
        let at = |cx: usize, cy: usize| scores[(cy - y_lo) * cols + (cx - x_lo)];
        if bx > x_lo && bx < x_hi {
            let (l, r) = (at(bx - 1, by), at(bx + 1, by));
            if l.is_finite() && r.is_finite() {
                x += parabolic_offset(l, score, r);
            }
        }
        if by > y_lo && by < y_hi {
            let (u, d) = (at(bx, by - 1), at(bx, by + 1));
            if u.is_finite() && d.is_finite() {
                y += parabolic_offset(u, score, d);
            }
        }
    }

    Some(PatchPeak { x, y, score })
}
