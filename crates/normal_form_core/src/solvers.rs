use anyhow::{anyhow, bail, Result};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, MinimizationReport};
use nalgebra::{DVector, Dyn};

use crate::settings::LevenbergMarquardtSettings;

#[derive(Debug)]
pub struct LeastSquaresReport {
    pub x: DVector<f64>,
    /// `½‖r(x₀)‖²` at the initial guess.
    pub initial_cost: f64,
    /// `½‖r(x)‖²` at the returned parameters.
    pub cost: f64,
    /// The solver's report, termination reason included.
    pub minimization: MinimizationReport<f64>,
}

impl LeastSquaresReport {
    pub fn converged(&self) -> bool {
        self.minimization.termination.was_successful()
    }
}

pub fn solver(settings: &LevenbergMarquardtSettings) -> Result<LevenbergMarquardt<f64>> {
    settings.validate()?;
    Ok(LevenbergMarquardt::new()
        .with_ftol(settings.ftol)
        .with_xtol(settings.xtol)
        .with_gtol(settings.gtol)
        .with_stepbound(settings.stepbound)
        .with_patience(settings.patience)
        .with_scale_diag(settings.scale_diag))
}

/// Minimize `½‖r(p)‖²` from the parameters the problem currently holds.
/// The problem comes back holding the solution.
pub fn levenberg_marquardt<P>(
    problem: P,
    settings: &LevenbergMarquardtSettings,
) -> Result<(P, LeastSquaresReport)>
where
    P: LeastSquaresProblem<f64, Dyn, Dyn>,
{
    let lm = solver(settings)?;
    let initial_cost = half_squared_norm(&problem)
        .ok_or_else(|| anyhow!("Residual could not be evaluated at the initial guess."))?;
    if !initial_cost.is_finite() {
        bail!("Residual is not finite at the initial guess.");
    }

    let (problem, minimization) = lm.minimize(problem);
    log::debug!(
        "LM stopped after {} evaluations: {:?}",
        minimization.number_of_evaluations,
        minimization.termination
    );
    let cost = half_squared_norm(&problem)
        .ok_or_else(|| anyhow!("Residual could not be evaluated at the solution."))?;
    let x = problem.params().clone_owned();
    Ok((
        problem,
        LeastSquaresReport {
            x,
            initial_cost,
            cost,
            minimization,
        },
    ))
}

fn half_squared_norm<P>(problem: &P) -> Option<f64>
where
    P: LeastSquaresProblem<f64, Dyn, Dyn>,
{
    problem.residuals().map(|r| 0.5 * r.norm_squared())
}
