//! Shape-preserving (PCHIP) cubic interpolation.
//!
//! Fritsch–Carlson derivatives: a weighted harmonic mean of neighbouring
//! secants in the interior, a one-sided three-point estimate at the ends,
//! zero slope at local extrema. The interpolant never overshoots the data,
//! which keeps sparse drift curves from growing spurious wiggles before the
//! model fit.

/// Monotone piecewise-cubic Hermite interpolant.
#[derive(Clone, Debug)]
pub struct MonotoneCubic {
    x: Vec<f64>,
    y: Vec<f64>,
    d: Vec<f64>,
}

impl MonotoneCubic {
    /// Build the interpolant. `x` must be strictly increasing with at least
    /// two knots; returns `None` otherwise.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Option<Self> {
        if x.len() != y.len() || x.len() < 2 {
            return None;
        }
        if x.windows(2).any(|w| !(w[1] > w[0])) || y.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let d = derivatives(&x, &y);
        Some(Self { x, y, d })
    }

    pub fn x_min(&self) -> f64 {
        self.x[0]
    }

    pub fn x_max(&self) -> f64 {
        self.x[self.x.len() - 1]
    }

    /// Evaluate at `t`, clamped to the knot range.
    pub fn evaluate(&self, t: f64) -> f64 {
        let t = t.clamp(self.x_min(), self.x_max());
        let k = self.segment(t);
        let h = self.x[k + 1] - self.x[k];
        let s = (t - self.x[k]) / h;
        let s2 = s * s;
        let s3 = s2 * s;
        let h00 = 2.0 * s3 - 3.0 * s2 + 1.0;
        let h10 = s3 - 2.0 * s2 + s;
        let h01 = -2.0 * s3 + 3.0 * s2;
        let h11 = s3 - s2;
        h00 * self.y[k] + h10 * h * self.d[k] + h01 * self.y[k + 1] + h11 * h * self.d[k + 1]
    }

    /// Uniform resampling from `x_min` to `x_max` with spacing `step`.
    ///
    /// The last knot is always included even when the range is not a whole
    /// number of steps.
    pub fn resample(&self, step: f64) -> (Vec<f64>, Vec<f64>) {
        let lo = self.x_min();
        let hi = self.x_max();
        let step = if step.is_finite() && step > 0.0 { step } else { hi - lo };
        let n = ((hi - lo) / step).floor() as usize;
        let mut xs: Vec<f64> = (0..=n).map(|i| lo + i as f64 * step).collect();
        if let Some(&last) = xs.last() {
            if hi - last > step * 1e-9 {
                xs.push(hi);
            }
        }
        let ys = xs.iter().map(|&t| self.evaluate(t)).collect();
        (xs, ys)
    }

    fn segment(&self, t: f64) -> usize {
        // partition_point returns the first knot strictly greater than t.
        let idx = self.x.partition_point(|&xk| xk <= t);
        idx.saturating_sub(1).min(self.x.len() - 2)
    }
}

fn derivatives(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    let delta: Vec<f64> = (0..n - 1).map(|k| (y[k + 1] - y[k]) / h[k]).collect();

    if n == 2 {
        return vec![delta[0], delta[0]];
    }

    let mut d = vec![0.0; n];
    for k in 1..n - 1 {
        let (a, b) = (delta[k - 1], delta[k]);
        if a * b <= 0.0 {
            continue;
        }
        let w1 = 2.0 * h[k] + h[k - 1];
        let w2 = h[k] + 2.0 * h[k - 1];
        d[k] = (w1 + w2) / (w1 / a + w2 / b);
    }
    d[0] = end_slope(h[0], h[1], delta[0], delta[1]);
    d[n - 1] = end_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
    d
}

/// One-sided three-point end slope, limited to keep the end segment monotone.
fn end_slope(h0: f64, h1: f64, m0: f64, m1: f64) -> f64 {
    let d = ((2.0 * h0 + h1) * m0 - h0 * m1) / (h0 + h1);
    if d.signum() != m0.signum() || m0 == 0.0 {
        0.0
    } else if m0.signum() != m1.signum() && d.abs() > 3.0 * m0.abs() {
        3.0 * m0
    } else {
        d
    }
}
