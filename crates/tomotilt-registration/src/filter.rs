//! Outlier rejection and smoothing of per-patch displacements.

use crate::CorrelationResult;

fn mean_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count() as f64;
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Iteratively drop patches farther than one standard deviation from the
/// per-axis mean.
///
/// Runs at most `passes` passes and stops early once a pass removes nothing.
/// A pass that would remove every patch is discarded, so the output is never
/// empty for non-empty input.
pub fn filter_outliers(results: &[CorrelationResult], passes: usize) -> Vec<CorrelationResult> {
    let mut kept = results.to_vec();
    for _ in 0..passes {
        if kept.len() < 2 {
            break;
        }
        let (mx, sx) = mean_std(kept.iter().map(|c| c.dx));
        let (my, sy) = mean_std(kept.iter().map(|c| c.dy));

        let next: Vec<CorrelationResult> = kept
            .iter()
            .copied()
            .filter(|c| (c.dx - mx).abs() <= sx && (c.dy - my).abs() <= sy)
            .collect();

        if next.is_empty() || next.len() == kept.len() {
            break;
        }
        kept = next;
    }
    kept
}

/// Box average with "valid" support: no padding, `len - kernel + 1` outputs.
///
/// Kernels of length 0 or 1, or longer than the input, return the input
/// unchanged.
pub fn box_smooth(values: &[f64], kernel: usize) -> Vec<f64> {
    if kernel <= 1 || kernel > values.len() {
        return values.to_vec();
    }
    let k = kernel as f64;
    let mut window: f64 = values[..kernel].iter().sum();
    let mut out = Vec::with_capacity(values.len() - kernel + 1);
    out.push(window / k);
    for i in kernel..values.len() {
        window += values[i] - values[i - kernel];
        out.push(window / k);
    }
    out
}

/// Kernel length used for `n` surviving patches.
pub fn smoothing_kernel(n: usize) -> usize {
    (n / 4).max(1)
}

/// Mean displacement (pixels) and mean confidence after smoothing.
pub(crate) fn aggregate(kept: &[CorrelationResult]) -> (f64, f64, f64) {
    let kernel = smoothing_kernel(kept.len());
    let xs: Vec<f64> = kept.iter().map(|c| c.dx).collect();
    let ys: Vec<f64> = kept.iter().map(|c| c.dy).collect();
    let sx = box_smooth(&xs, kernel);
    let sy = box_smooth(&ys, kernel);
    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
    let confidence = kept.iter().map(|c| c.confidence).sum::<f64>() / kept.len() as f64;
    (mean(&sx), mean(&sy), confidence)
}
