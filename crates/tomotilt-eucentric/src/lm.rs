//! Bounded Levenberg–Marquardt for small dense least-squares problems.

use log::trace;
use nalgebra::{DMatrix, DVector};

use crate::CalibrationError;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e16;
/// Relative cost decrease below which the solver stops.
const FTOL: f64 = 1e-15;

/// Residuals `r(p) = model(p) − data` and their Jacobian.
pub(crate) trait LeastSquaresProblem {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64>;
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64>;
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LmOptions {
    pub max_iterations: usize,
    /// Step-size tolerance relative to the parameter norm.
    pub xtol: f64,
    /// Parameters are clamped to `[-bound, bound]`.
    pub bound: f64,
}

#[derive(Clone, Debug)]
pub(crate) struct LmSolution {
    pub params: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub rss: f64,
    pub residuals: DVector<f64>,
    pub iterations: usize,
}

fn diverged(reason: impl Into<String>, iterations: usize) -> CalibrationError {
    CalibrationError::FitDivergence {
        reason: reason.into(),
        iterations,
    }
}

fn clamp(p: DVector<f64>, bound: f64) -> DVector<f64> {
    p.map(|v| v.clamp(-bound, bound))
}

/// Minimise `‖r(p)‖²` from `initial`.
///
/// Fails when the iteration budget runs out, the cost stops being finite, a
/// parameter ends on its bound, or the normal matrix at the optimum is
/// singular (no covariance).
pub(crate) fn solve<P: LeastSquaresProblem>(
    problem: &P,
    initial: DVector<f64>,
    opts: LmOptions,
) -> Result<LmSolution, CalibrationError> {
    let mut p = clamp(initial, opts.bound);
    let mut r = problem.residuals(&p);
    let mut cost = r.norm_squared();
    if !cost.is_finite() {
        return Err(diverged("initial residuals are not finite", 0));
    }

    let mut lambda = LAMBDA_INIT;
    let mut iterations = 0;
    let mut converged = cost == 0.0;

    while !converged {
        if iterations >= opts.max_iterations {
            return Err(diverged("iteration limit reached", iterations));
        }
        iterations += 1;

        let j = problem.jacobian(&p);
        let jtj = j.tr_mul(&j);
        let g = j.tr_mul(&r);
        if g.amax() == 0.0 {
            break;
        }

        loop {
            let mut a = jtj.clone();
            for k in 0..a.nrows() {
                let d = jtj[(k, k)];
                a[(k, k)] += lambda * if d > 0.0 { d } else { 1.0 };
            }
            let Some(chol) = a.cholesky() else {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    return Err(diverged("damped normal matrix is not positive definite", iterations));
                }
                continue;
            };
            let step = chol.solve(&(-&g));
            let candidate = clamp(&p + &step, opts.bound);
            let r_new = problem.residuals(&candidate);
            let cost_new = r_new.norm_squared();

            if cost_new.is_finite() && cost_new <= cost {
                let moved = (&candidate - &p).norm();
                let decrease = cost - cost_new;
                converged = moved <= opts.xtol * (p.norm() + opts.xtol) || decrease <= FTOL * cost || cost_new == 0.0;
                p = candidate;
                r = r_new;
                cost = cost_new;
                lambda = (lambda / 10.0).max(LAMBDA_MIN);
                trace!("lm iter {iterations}: cost {cost:.6e}, lambda {lambda:.1e}");
                break;
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                // No damped step improves the cost: this is the optimum.
                converged = true;
                break;
            }
        }
    }

    if let Some(k) = p.iter().position(|v| v.abs() >= opts.bound) {
        return Err(diverged(format!("parameter {k} reached the bound {:e}", opts.bound), iterations));
    }

    let j = problem.jacobian(&p);
    let n = j.nrows();
    let dof = n.saturating_sub(j.ncols()).max(1) as f64;
    let inv = j
        .tr_mul(&j)
        .try_inverse()
        .ok_or_else(|| diverged("normal matrix is singular at the optimum", iterations))?;
    let covariance = inv * (cost / dof);

    Ok(LmSolution {
        params: p,
        covariance,
        rss: cost,
        residuals: r,
        iterations,
    })
}
