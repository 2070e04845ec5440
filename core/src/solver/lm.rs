//! Levenberg-Marquardt for small dense systems.
//!
//! Each iteration solves `(J^T J + lambda I) dx = -J^T F` by Cholesky. The
//! damping shrinks after a step that does not increase the cost and grows
//! after one that does, within `[lambda_min, lambda_max]`.

use crate::config::SolverConfig;
use crate::constraint::eval::EvalFailure;
use nalgebra::{DMatrix, DVector};
use tracing::trace;

/// A nonlinear least-squares problem `min 0.5 |F(x)|^2`.
pub trait LeastSquares {
    /// Number of unknowns.
    fn dimension(&self) -> usize;

    fn residual_len(&self) -> usize;

    fn residual(&self, x: &[f64]) -> Result<DVector<f64>, EvalFailure>;

    /// Residual and Jacobian at `x`.
    fn linearize(&self, x: &[f64]) -> Result<(DVector<f64>, DMatrix<f64>), EvalFailure>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LmSettings {
    pub max_iterations: usize,
    pub residual_tolerance: f64,
    pub step_tolerance: f64,
    pub gradient_tolerance: f64,
    pub lambda_initial: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    pub lambda_factor: f64,
    pub pivot_tolerance: f64,
}

impl LmSettings {
    pub fn from_config(config: &SolverConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            residual_tolerance: config.residual_tolerance,
            step_tolerance: config.step_tolerance,
            gradient_tolerance: config.gradient_tolerance,
            lambda_initial: config.lambda_initial,
            lambda_min: config.lambda_min,
            lambda_max: config.lambda_max,
            lambda_factor: config.lambda_factor,
            pivot_tolerance: config.pivot_tolerance,
        }
    }

    /// Same tolerances with the interactive iteration cap.
    pub fn for_drag(config: &SolverConfig) -> Self {
        Self { max_iterations: config.drag_max_iterations, ..Self::from_config(config) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LmOutcome {
    Converged,
    /// No descent direction left while residuals are above tolerance.
    Stationary,
    NoConvergence,
    /// A residual row with a non-negligible value has a vanishing Jacobian row,
    /// or the damped normal equations could not be factored.
    Singular,
    NonFinite,
    Eval(EvalFailure),
}

#[derive(Debug, Clone)]
pub struct LmResult {
    pub x: Vec<f64>,
    pub outcome: LmOutcome,
    pub iterations: usize,
    /// `|F|_inf` at `x`.
    pub max_residual: f64,
}

fn finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

pub fn solve<P: LeastSquares + ?Sized>(problem: &P, x0: &[f64], settings: &LmSettings) -> LmResult {
    let mut x = x0.to_vec();
    let done = |x: Vec<f64>, outcome, iterations, max_residual| LmResult { x, outcome, iterations, max_residual };

    let (mut f, mut jac) = match problem.linearize(&x) {
        Ok(lin) => lin,
        Err(EvalFailure::Degenerate) => return done(x, LmOutcome::Singular, 0, f64::NAN),
        Err(e) => return done(x, LmOutcome::Eval(e), 0, f64::NAN),
    };
    let n = problem.dimension();
    if n == 0 {
        let fmax = f.amax();
        let outcome = if fmax < settings.residual_tolerance { LmOutcome::Converged } else { LmOutcome::Stationary };
        return done(x, outcome, 0, fmax);
    }

    let mut lambda = settings.lambda_initial;
    let mut cost = 0.5 * f.norm_squared();
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        let fmax = f.amax();
        if !finite(&f) || jac.iter().any(|v| !v.is_finite()) {
            return done(x, LmOutcome::NonFinite, iterations, fmax);
        }

        // A residual that no parameter can move.
        for i in 0..f.len() {
            if f[i].abs() > settings.residual_tolerance && jac.row(i).amax() < settings.pivot_tolerance {
                return done(x, LmOutcome::Singular, iterations, fmax);
            }
        }

        let gradient = jac.transpose() * &f;
        if fmax >= settings.residual_tolerance && gradient.amax() <= settings.gradient_tolerance * fmax {
            return done(x, LmOutcome::Stationary, iterations, fmax);
        }

        iterations += 1;
        let normal = jac.transpose() * &jac;
        let Some(chol) = (normal + DMatrix::identity(n, n) * lambda).cholesky() else {
            lambda *= settings.lambda_factor;
            if lambda > settings.lambda_max {
                return done(x, LmOutcome::Singular, iterations, fmax);
            }
            continue;
        };
        let step = chol.solve(&(-&gradient));
        let step_max = step.amax();
        let candidate: Vec<f64> = x.iter().zip(step.iter()).map(|(a, d)| a + d).collect();

        let trial = problem.residual(&candidate).ok().filter(finite);
        let accepted = match &trial {
            Some(f_new) => 0.5 * f_new.norm_squared() <= cost,
            None => false,
        };
        trace!(iteration = iterations, lambda, max_residual = fmax, step = step_max, accepted, "lm step");

        if accepted {
            x = candidate;
            match problem.linearize(&x) {
                Ok((f_new, jac_new)) => {
                    f = f_new;
                    jac = jac_new;
                }
                Err(EvalFailure::Degenerate) => return done(x, LmOutcome::Singular, iterations, fmax),
                Err(e) => return done(x, LmOutcome::Eval(e), iterations, fmax),
            }
            cost = 0.5 * f.norm_squared();
            lambda = (lambda / settings.lambda_factor).max(settings.lambda_min);

            let fmax = f.amax();
            if fmax < settings.residual_tolerance && step_max < settings.step_tolerance {
                return done(x, LmOutcome::Converged, iterations, fmax);
            }
        } else {
            // Already on the solution; rounding kept the step from lowering the cost.
            if fmax < settings.residual_tolerance && step_max < settings.step_tolerance {
                return done(x, LmOutcome::Converged, iterations, fmax);
            }
            lambda *= settings.lambda_factor;
            if lambda > settings.lambda_max {
                let outcome =
                    if fmax < settings.residual_tolerance { LmOutcome::Converged } else { LmOutcome::Stationary };
                return done(x, outcome, iterations, fmax);
            }
        }
    }

    let fmax = f.amax();
    done(x, LmOutcome::NoConvergence, iterations, fmax)
}
