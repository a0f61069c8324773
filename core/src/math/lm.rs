//! Nonlinear least-squares curve fitting.
//!
//! `CurveFitter` is the seam the fit engine talks to; `LevenbergMarquardt` is the
//! default solver behind it.

use log::debug;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::math::matrix::MatrixHelper;
use crate::prelude::{StageError, StageResult};

/// Model evaluated at abscissa `x` with parameter vector `params`.
pub type ModelFn<'a> = dyn Fn(f64, &[f64]) -> StageResult<f64> + 'a;

/// Solver tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveFitOptions {
    pub max_iterations: usize,
    /// Relative chi-square change treated as converged.
    pub ftol: f64,
    /// Relative parameter step treated as converged.
    pub xtol: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
}

impl Default for CurveFitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1.49012e-8,
            xtol: 1.49012e-8,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// Optimal parameters and their covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveFit {
    pub params: Vec<f64>,
    pub covariance: Array2<f64>,
    pub chi2: f64,
    pub iterations: usize,
}

/// Least-squares solver collaborator.
pub trait CurveFitter {
    /// Fits `model` to `(x, y)` starting from `initial`. With `sigma`, residuals are
    /// divided by the per-point uncertainties.
    fn curve_fit(
        &self,
        model: &ModelFn<'_>,
        x: &[f64],
        y: &[f64],
        initial: &[f64],
        sigma: Option<&[f64]>,
    ) -> StageResult<CurveFit>;
}

#[derive(Debug, Clone, Default)]
pub struct LevenbergMarquardt {
    options: CurveFitOptions,
}

impl LevenbergMarquardt {
    pub fn new(options: CurveFitOptions) -> Self {
        Self { options }
    }

    fn residuals(
        model: &ModelFn<'_>,
        x: &[f64],
        y: &[f64],
        weights: &[f64],
        params: &[f64],
    ) -> StageResult<Array1<f64>> {
        let mut out = Array1::zeros(x.len());
        for (i, ((&xi, &yi), &wi)) in x.iter().zip(y).zip(weights).enumerate() {
            out[i] = (yi - model(xi, params)?) * wi;
        }
        Ok(out)
    }

    /// Forward-difference Jacobian of the weighted model (n × p).
    fn jacobian(
        model: &ModelFn<'_>,
        x: &[f64],
        weights: &[f64],
        params: &[f64],
    ) -> StageResult<Array2<f64>> {
        let step_scale = f64::EPSILON.sqrt();
        let mut jac = Array2::zeros((x.len(), params.len()));
        let mut shifted = params.to_vec();
        for j in 0..params.len() {
            let h = step_scale * params[j].abs().max(1.0);
            shifted[j] = params[j] + h;
            for (i, (&xi, &wi)) in x.iter().zip(weights).enumerate() {
                let hi = model(xi, &shifted)?;
                let lo = model(xi, params)?;
                jac[[i, j]] = (hi - lo) / h * wi;
            }
            shifted[j] = params[j];
        }
        Ok(jac)
    }
}

impl CurveFitter for LevenbergMarquardt {
    fn curve_fit(
        &self,
        model: &ModelFn<'_>,
        x: &[f64],
        y: &[f64],
        initial: &[f64],
        sigma: Option<&[f64]>,
    ) -> StageResult<CurveFit> {
        let n = x.len();
        let p = initial.len();
        if y.len() != n {
            return Err(StageError::InvalidInput(format!(
                "curve fit needs matching x/y lengths, got {} and {}",
                n,
                y.len()
            )));
        }
        if p == 0 || n <= p {
            return Err(StageError::InvalidInput(format!(
                "curve fit needs more data points ({}) than parameters ({})",
                n, p
            )));
        }

        let weights: Vec<f64> = match sigma {
            Some(sigma) => {
                if sigma.len() != n {
                    return Err(StageError::InvalidInput(format!(
                        "sigma length {} does not match data length {}",
                        sigma.len(),
                        n
                    )));
                }
                if let Some(bad) = sigma.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
                    return Err(StageError::InvalidInput(format!(
                        "sigma values must be finite and positive, found {}",
                        bad
                    )));
                }
                sigma.iter().map(|s| 1.0 / s).collect()
            }
            None => vec![1.0; n],
        };

        let opts = &self.options;
        let mut params = initial.to_vec();
        let mut residual = Self::residuals(model, x, y, &weights, &params)?;
        let mut chi2 = residual.dot(&residual);
        let mut lambda = opts.initial_lambda;
        let mut converged = chi2 == 0.0;
        let mut iterations = 0;

        while !converged && iterations < opts.max_iterations {
            iterations += 1;

            let jac = Self::jacobian(model, x, &weights, &params)?;
            let normal = jac.t().dot(&jac);
            let gradient = jac.t().dot(&residual);

            let mut damped = normal.clone();
            for i in 0..p {
                damped[[i, i]] += lambda * normal[[i, i]].max(f64::MIN_POSITIVE);
            }
            let delta =
                MatrixHelper::solve(&damped, &gradient).ok_or_else(|| StageError::FitConvergence {
                    iterations,
                    chi2,
                    reason: "singular normal matrix".into(),
                })?;

            let candidate: Vec<f64> = params.iter().zip(delta.iter()).map(|(a, d)| a + d).collect();
            let candidate_residual = Self::residuals(model, x, y, &weights, &candidate)?;
            let candidate_chi2 = candidate_residual.dot(&candidate_residual);

            let relative_change = (chi2 - candidate_chi2).abs() / chi2.max(f64::MIN_POSITIVE);

            if candidate_chi2.is_finite() && candidate_chi2 <= chi2 {
                let step_small = delta
                    .iter()
                    .zip(candidate.iter())
                    .all(|(d, value)| d.abs() <= opts.xtol * (value.abs() + opts.xtol));
                params = candidate;
                residual = candidate_residual;
                chi2 = candidate_chi2;
                lambda *= opts.lambda_down;
                converged = step_small || relative_change <= opts.ftol || chi2 == 0.0;
            } else {
                lambda *= opts.lambda_up;
                // no step can lower chi2 any further
                converged = candidate_chi2.is_finite() && relative_change <= opts.ftol;
                if !converged && lambda > 1e16 {
                    break;
                }
            }
        }

        if !converged {
            return Err(StageError::FitConvergence {
                iterations,
                chi2,
                reason: "iteration limit reached before convergence".into(),
            });
        }

        let jac = Self::jacobian(model, x, &weights, &params)?;
        let normal = jac.t().dot(&jac);
        let inverse = MatrixHelper::invert(&normal).ok_or_else(|| StageError::FitConvergence {
            iterations,
            chi2,
            reason: "singular Jacobian at solution; covariance undefined".into(),
        })?;
        let scale = chi2 / (n - p) as f64;
        let covariance = inverse.mapv(|v| v * scale);

        debug!(
            "curve fit converged in {} iterations, chi2 {:.6e}, params {:?}",
            iterations, chi2, params
        );

        Ok(CurveFit {
            params,
            covariance,
            chi2,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line(x: f64, p: &[f64]) -> StageResult<f64> {
        Ok(p[0] * x + p[1])
    }

    #[test]
    fn recovers_exact_linear_parameters() {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|&v| 3.0 * v - 2.0).collect();
        let fit = LevenbergMarquardt::default()
            .curve_fit(&line, &x, &y, &[100.0, 50.0], None)
            .unwrap();
        assert_relative_eq!(fit.params[0], 3.0, max_relative = 1e-6);
        assert_relative_eq!(fit.params[1], -2.0, max_relative = 1e-6);
        assert_eq!(fit.covariance.dim(), (2, 2));
    }

    #[test]
    fn recovers_exponential_decay() {
        let model = |x: f64, p: &[f64]| -> StageResult<f64> { Ok(p[0] * (-p[1] * x).exp()) };
        let x: Vec<f64> = (0..30).map(|i| i as f64 * 0.2).collect();
        let y: Vec<f64> = x.iter().map(|&v| 5.0 * (-0.7 * v).exp()).collect();
        let fit = LevenbergMarquardt::default()
            .curve_fit(&model, &x, &y, &[1.0, 0.1], None)
            .unwrap();
        assert_relative_eq!(fit.params[0], 5.0, max_relative = 1e-5);
        assert_relative_eq!(fit.params[1], 0.7, max_relative = 1e-5);
    }

    #[test]
    fn covariance_scales_with_residual_variance() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, &v)| 2.0 * v + 1.0 + if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let fit = LevenbergMarquardt::default()
            .curve_fit(&line, &x, &y, &[1.0, 0.0], None)
            .unwrap();
        assert!(fit.covariance[[0, 0]] > 0.0);
        assert!(fit.covariance[[1, 1]] > 0.0);
        assert_relative_eq!(fit.covariance[[0, 1]], fit.covariance[[1, 0]], max_relative = 1e-6);
    }

    #[test]
    fn rejects_non_positive_sigma() {
        let x = [0.0, 1.0, 2.0];
        let y = [1.0, 2.0, 3.0];
        let result = LevenbergMarquardt::default().curve_fit(
            &line,
            &x,
            &y,
            &[1.0, 0.0],
            Some(&[1.0, 0.0, 1.0]),
        );
        assert!(matches!(result, Err(StageError::InvalidInput(_))));
    }

    #[test]
    fn rejects_underdetermined_fit() {
        let result =
            LevenbergMarquardt::default().curve_fit(&line, &[0.0, 1.0], &[1.0, 2.0], &[1.0, 0.0], None);
        assert!(matches!(result, Err(StageError::InvalidInput(_))));
    }

    #[test]
    fn iteration_limit_surfaces_as_convergence_error() {
        let model = |x: f64, p: &[f64]| -> StageResult<f64> { Ok(p[0] * (-p[1] * x).exp()) };
        let x: Vec<f64> = (0..30).map(|i| i as f64 * 0.2).collect();
        let y: Vec<f64> = x.iter().map(|&v| 5.0 * (-0.7 * v).exp()).collect();
        let solver = LevenbergMarquardt::new(CurveFitOptions {
            max_iterations: 1,
            ..Default::default()
        });
        let result = solver.curve_fit(&model, &x, &y, &[1.0, 0.1], None);
        assert!(matches!(
            result,
            Err(StageError::FitConvergence { iterations: 1, .. })
        ));
    }

    #[test]
    fn unconstrained_parameter_has_no_covariance() {
        let model = |x: f64, p: &[f64]| -> StageResult<f64> { Ok(p[0] * x + 0.0 * p[1]) };
        let x: Vec<f64> = (1..12).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|&v| 2.5 * v).collect();
        let result = LevenbergMarquardt::default().curve_fit(&model, &x, &y, &[1.0, 3.0], None);
        assert!(matches!(result, Err(StageError::FitConvergence { .. })));
    }
}
