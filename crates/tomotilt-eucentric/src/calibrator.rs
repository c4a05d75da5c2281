use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tomotilt_core::{AngularPosition, DisplacementComponent, DisplacementSample, SweepDirection};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::interp::MonotoneCubic;
use crate::lm::{self, LeastSquaresProblem, LmOptions, LmSolution};
use crate::{CalibrationError, EucentricModel};

/// Fewest distinct tilt angles a fit accepts.
pub const MIN_DISTINCT_ANGLES: usize = 3;

/// Configuration for [`EucentricAxisCalibrator`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibratorParams {
    /// Image axis whose drift is fitted.
    pub component: DisplacementComponent,
    /// Spacing of the densified curve, degrees.
    pub resample_step_deg: f64,
    pub model: EucentricModel,
    pub max_iterations: usize,
    /// Relative step tolerance of the solver.
    pub tolerance: f64,
    /// Parameters are confined to `[-parameter_bound, parameter_bound]`.
    pub parameter_bound: f64,
    /// Polish the densified-curve fit on the raw samples.
    pub refine_on_samples: bool,
}

impl Default for CalibratorParams {
    fn default() -> Self {
        Self {
            component: DisplacementComponent::Y,
            resample_step_deg: 0.1,
            model: EucentricModel::Planar,
            max_iterations: 200,
            tolerance: 1e-10,
            parameter_bound: 1e7,
            refine_on_samples: true,
        }
    }
}

/// Which data set produced the reported parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStage {
    Densified,
    Samples,
}

/// Fitted rotation-axis offset.
///
/// `y0`/`z0` describe the physical axis and do not depend on the order in
/// which the samples were captured; [`y0_along_sweep`](Self::y0_along_sweep)
/// gives the direction-normalized value used for corrections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisOffsetModel {
    pub model: EucentricModel,
    pub y0: f64,
    pub z0: f64,
    pub r: Option<f64>,
    pub sigma_y0: f64,
    pub sigma_z0: f64,
    pub sigma_r: Option<f64>,
    pub direction: SweepDirection,
    /// Sample whose displacement was subtracted from the curve.
    pub baseline_angle: AngularPosition,
    pub rms_residual: f64,
    /// `RSS / (n − p)` of the reported stage.
    pub residual_variance: f64,
    pub samples_used: usize,
    pub iterations: usize,
    pub stage: FitStage,
}

impl AxisOffsetModel {
    pub fn y0_along_sweep(&self) -> f64 {
        self.direction.sign() as f64 * self.y0
    }

    /// Parameters in model order (`y, z[, r]`).
    pub fn params(&self) -> Vec<f64> {
        let mut p = vec![self.y0, self.z0];
        if let Some(r) = self.r {
            p.push(r);
        }
        p
    }

    /// Baseline-relative displacement the model predicts at `angle`.
    pub fn predict(&self, angle: AngularPosition) -> f64 {
        self.model.evaluate(angle.radians(), &self.params())
    }
}

/// Fits a rotation-offset model to an (angle, displacement) drift curve.
#[derive(Clone, Debug, Default)]
pub struct EucentricAxisCalibrator {
    params: CalibratorParams,
}

struct CurveProblem<'a> {
    model: EucentricModel,
    theta: &'a [f64],
    values: &'a [f64],
}

impl LeastSquaresProblem for CurveProblem<'_> {
    fn residuals(&self, p: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.theta.len(),
            self.theta
                .iter()
                .zip(self.values)
                .map(|(&t, &v)| self.model.evaluate(t, p.as_slice()) - v),
        )
    }

    fn jacobian(&self, _p: &DVector<f64>) -> DMatrix<f64> {
        let m = self.model.param_count();
        let mut j = DMatrix::zeros(self.theta.len(), m);
        let mut row = [0.0; 3];
        for (i, &t) in self.theta.iter().enumerate() {
            self.model.basis(t, &mut row);
            for k in 0..m {
                j[(i, k)] = row[k];
            }
        }
        j
    }
}

/// Ascending, de-duplicated `(degrees, value)` curve with its baseline removed.
struct PreparedCurve {
    degrees: Vec<f64>,
    values: Vec<f64>,
    baseline_angle: AngularPosition,
}

fn prepare(samples: &[DisplacementSample], component: DisplacementComponent) -> Result<PreparedCurve, CalibrationError> {
    if let Some(bad) = samples.iter().find(|s| !s.component(component).is_finite()) {
        return Err(CalibrationError::NonFiniteSample {
            angle_deg: bad.angle.degrees(),
        });
    }

    let mut sorted: Vec<(AngularPosition, f64)> = samples.iter().map(|s| (s.angle, s.component(component))).collect();
    sorted.sort_by_key(|&(a, _)| a);

    // Repeated angles are averaged.
    let mut merged: Vec<(AngularPosition, f64, usize)> = Vec::with_capacity(sorted.len());
    for (angle, value) in sorted {
        match merged.last_mut() {
            Some((a, sum, count)) if *a == angle => {
                *sum += value;
                *count += 1;
            }
            _ => merged.push((angle, value, 1)),
        }
    }

    if merged.len() < MIN_DISTINCT_ANGLES {
        return Err(CalibrationError::InsufficientData {
            got: merged.len(),
            need: MIN_DISTINCT_ANGLES,
        });
    }

    // First minimum wins, so ties at ±a resolve to the negative angle.
    let (baseline_angle, baseline) = merged
        .iter()
        .map(|&(a, sum, count)| (a, sum / count as f64))
        .min_by_key(|(a, _)| a.abs())
        .unwrap_or((AngularPosition::ZERO, 0.0));

    Ok(PreparedCurve {
        degrees: merged.iter().map(|(a, _, _)| a.degrees()).collect(),
        values: merged.iter().map(|&(_, sum, count)| sum / count as f64 - baseline).collect(),
        baseline_angle,
    })
}

impl EucentricAxisCalibrator {
    pub fn new(params: CalibratorParams) -> Self {
        Self { params }
    }

    #[inline]
    pub fn params(&self) -> &CalibratorParams {
        &self.params
    }

    /// Fit the configured model.
    pub fn fit(&self, samples: &[DisplacementSample]) -> Result<AxisOffsetModel, CalibrationError> {
        self.fit_model(samples, self.params.model)
    }

    /// Fit `model` regardless of the configured one.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, samples), fields(samples = samples.len(), model = model.name()))
    )]
    pub fn fit_model(
        &self,
        samples: &[DisplacementSample],
        model: EucentricModel,
    ) -> Result<AxisOffsetModel, CalibrationError> {
        model.validate()?;
        let p = &self.params;
        if !(p.resample_step_deg.is_finite() && p.resample_step_deg > 0.0) {
            return Err(CalibrationError::InvalidModel(format!(
                "resample step must be positive, got {}",
                p.resample_step_deg
            )));
        }
        if !(p.parameter_bound.is_finite() && p.parameter_bound > 0.0) {
            return Err(CalibrationError::InvalidModel(format!(
                "parameter bound must be positive, got {}",
                p.parameter_bound
            )));
        }

        let direction = SweepDirection::of_sequence(samples);
        let curve = prepare(samples, p.component)?;
        let opts = LmOptions {
            max_iterations: p.max_iterations,
            xtol: p.tolerance,
            bound: p.parameter_bound,
        };

        let interp = MonotoneCubic::new(curve.degrees.clone(), curve.values.clone()).ok_or_else(|| {
            CalibrationError::InvalidModel("drift curve cannot be interpolated".to_string())
        })?;
        let (dense_deg, dense_values) = interp.resample(p.resample_step_deg);
        let dense_theta: Vec<f64> = dense_deg.iter().map(|d| d.to_radians()).collect();
        let dense = CurveProblem {
            model,
            theta: &dense_theta,
            values: &dense_values,
        };
        let mut solution = lm::solve(&dense, DVector::zeros(model.param_count()), opts)?;
        let mut stage = FitStage::Densified;
        let mut n = dense_theta.len();
        let mut iterations = solution.iterations;
        debug!(
            "{} fit on {} resampled points: params {:?}, rss {:.3e}",
            model.name(),
            n,
            solution.params.as_slice(),
            solution.rss
        );

        if p.refine_on_samples && curve.degrees.len() > model.param_count() {
            let theta: Vec<f64> = curve.degrees.iter().map(|d| d.to_radians()).collect();
            let raw = CurveProblem {
                model,
                theta: &theta,
                values: &curve.values,
            };
            match lm::solve(&raw, solution.params.clone(), opts) {
                Ok(polished) => {
                    iterations += polished.iterations;
                    solution = polished;
                    stage = FitStage::Samples;
                    n = theta.len();
                }
                Err(err) => warn!("refinement on raw samples failed, keeping resampled fit: {err}"),
            }
        }

        let model_out = build_model(model, &solution, direction, &curve, n, iterations, stage);
        debug!(
            "fitted {}: y0 {:.4e} ± {:.2e}, z0 {:.4e} ± {:.2e}, direction {:?}",
            model.name(),
            model_out.y0,
            model_out.sigma_y0,
            model_out.z0,
            model_out.sigma_z0,
            model_out.direction
        );
        Ok(model_out)
    }

    /// Fit every candidate and keep the one with the lowest residual variance.
    ///
    /// Variances at the numerical noise floor of the data compare equal, so
    /// earlier (simpler) candidates win ties. Fails with the first error when
    /// no candidate fits.
    pub fn fit_best(
        &self,
        samples: &[DisplacementSample],
        candidates: &[EucentricModel],
    ) -> Result<AxisOffsetModel, CalibrationError> {
        let scale = samples
            .iter()
            .map(|s| s.component(self.params.component).powi(2))
            .sum::<f64>()
            / samples.len().max(1) as f64;
        let floor = scale * 1e-20;

        let mut best: Option<AxisOffsetModel> = None;
        let mut first_err = None;
        for &candidate in candidates {
            match self.fit_model(samples, candidate) {
                Ok(fit) => {
                    let score = fit.residual_variance.max(floor);
                    debug!("candidate {}: residual variance {:.3e}", candidate.name(), fit.residual_variance);
                    let better = best.as_ref().map_or(true, |b| score < b.residual_variance.max(floor));
                    if better {
                        best = Some(fit);
                    }
                }
                Err(err) => {
                    debug!("candidate {} failed: {err}", candidate.name());
                    first_err.get_or_insert(err);
                }
            }
        }

        best.ok_or_else(|| {
            first_err.unwrap_or_else(|| CalibrationError::InvalidModel("no candidate models".to_string()))
        })
    }
}

fn build_model(
    model: EucentricModel,
    solution: &LmSolution,
    direction: SweepDirection,
    curve: &PreparedCurve,
    n: usize,
    iterations: usize,
    stage: FitStage,
) -> AxisOffsetModel {
    let p = &solution.params;
    let sigma = |k: usize| solution.covariance[(k, k)].max(0.0).sqrt();
    let curved = model.param_count() == 3;
    let dof = n.saturating_sub(model.param_count()).max(1) as f64;

    AxisOffsetModel {
        model,
        y0: p[0],
        z0: p[1],
        r: curved.then(|| p[2]),
        sigma_y0: sigma(0),
        sigma_z0: sigma(1),
        sigma_r: curved.then(|| sigma(2)),
        direction,
        baseline_angle: curve.baseline_angle,
        rms_residual: (solution.rss / n.max(1) as f64).sqrt(),
        residual_variance: solution.rss / dof,
        samples_used: curve.degrees.len(),
        iterations,
        stage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(deg: f64, dy: f64) -> DisplacementSample {
        DisplacementSample::new(AngularPosition::from_degrees(deg), 0.0, dy)
    }

    #[test]
    fn duplicate_angles_are_averaged() {
        let curve = prepare(&[s(0.0, 1.0), s(5.0, 2.0), s(5.0, 4.0), s(10.0, 5.0)], DisplacementComponent::Y).unwrap();
        assert_eq!(curve.degrees, vec![0.0, 5.0, 10.0]);
        assert_eq!(curve.values, vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn baseline_is_sample_nearest_zero() {
        let curve = prepare(&[s(20.0, 7.0), s(30.0, 9.0), s(40.0, 12.0)], DisplacementComponent::Y).unwrap();
        assert_eq!(curve.baseline_angle, AngularPosition::from_degrees(20.0));
        assert_eq!(curve.values, vec![0.0, 2.0, 5.0]);

        let tie = prepare(&[s(-5.0, 1.0), s(5.0, 3.0), s(10.0, 4.0)], DisplacementComponent::Y).unwrap();
        assert_eq!(tie.baseline_angle, AngularPosition::from_degrees(-5.0));
    }

    #[test]
    fn non_finite_sample_is_rejected() {
        let err = prepare(&[s(0.0, 0.0), s(1.0, f64::NAN), s(2.0, 1.0)], DisplacementComponent::Y)
            .err()
            .unwrap();
        assert!(matches!(err, CalibrationError::NonFiniteSample { .. }));
    }

    #[test]
    fn too_few_distinct_angles() {
        let err = prepare(&[s(0.0, 0.0), s(1.0, 1.0), s(1.0, 2.0)], DisplacementComponent::Y)
            .err()
            .unwrap();
        assert_eq!(err, CalibrationError::InsufficientData { got: 2, need: 3 });
    }
}
