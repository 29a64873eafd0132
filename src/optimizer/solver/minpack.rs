//! Adapter running a [`Problem`] through the `levenberg-marquardt` crate.
//!
//! The crate optimizes a flat vector, so the problem is exposed as a tangent
//! offset `x` from a base point: parameters are `base ⊞ x`. Robust losses are
//! folded into the residuals with [`LossMode::CostScaled`] since the crate only
//! sees a plain sum of squares.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use tracing::{debug, warn};

use super::{with_thread_pool, Solver, SolverOptions, SolverSummary, Termination};
use crate::optimizer::problem::{ColumnLayout, LossMode, Problem};

/// Rotation columns are only exact at `x = 0`, so the base is moved to the
/// current estimate and the crate restarted a few times.
const MAX_REBASES: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct MinpackSolver;

impl Solver for MinpackSolver {
    fn solve(&self, problem: &mut Problem, options: &SolverOptions) -> SolverSummary {
        let layout = problem.free_layout();
        if layout.num_columns() == 0 || problem.num_residual_blocks() == 0 {
            return SolverSummary::trivial(problem.cost());
        }
        with_thread_pool(options.num_threads, || run(problem, &layout, options))
    }
}

struct TangentProblem<'a> {
    problem: &'a mut Problem,
    layout: &'a ColumnLayout,
    base: Vec<Vec<f64>>,
    x: DVector<f64>,
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for TangentProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.problem.restore(&self.base);
        self.problem.apply_step(self.layout, x);
        self.x.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = self.problem.robust_residual_vector();
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let j = self.problem.linearize(self.layout, LossMode::CostScaled).jacobian;
        j.iter().all(|v| v.is_finite()).then_some(j)
    }
}

fn run(problem: &mut Problem, layout: &ColumnLayout, options: &SolverOptions) -> SolverSummary {
    let initial_cost = problem.cost();
    let initial = problem.snapshot();
    let mut cost = initial_cost;
    let mut evaluations = 0;
    let mut rounds = 0;
    let mut termination = Termination::MaxIterations;

    while rounds < MAX_REBASES && evaluations < options.max_iterations {
        rounds += 1;
        let base = problem.snapshot();
        let tangent = TangentProblem {
            problem: &mut *problem,
            layout,
            base: base.clone(),
            x: DVector::zeros(layout.num_columns()),
        };

        let (mut tangent, report) = LevenbergMarquardt::new()
            .with_patience(options.max_iterations - evaluations)
            .with_ftol(options.function_tolerance)
            .with_xtol(options.parameter_tolerance)
            .with_gtol(options.gradient_tolerance)
            .minimize(tangent);
        let x = tangent.params();
        tangent.set_params(&x);
        evaluations += report.number_of_evaluations;

        let new_cost = problem.cost();
        if !new_cost.is_finite() || new_cost > cost {
            problem.restore(&base);
            if !report.termination.was_successful() {
                warn!("Minpack solve failed: {:?}", report.termination);
                termination = Termination::NumericalFailure;
            }
            break;
        }

        let relative_decrease = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
        cost = new_cost;
        if !report.termination.was_successful() {
            debug!("Minpack stopped: {:?}", report.termination);
            break;
        }
        if relative_decrease < options.function_tolerance {
            termination = Termination::Converged;
            break;
        }
        termination = Termination::Converged;
    }

    if cost > initial_cost {
        problem.restore(&initial);
        cost = initial_cost;
    }

    debug!(evaluations, rounds, initial_cost, final_cost = cost, ?termination, "minpack solve finished");

    SolverSummary {
        iterations: evaluations,
        successful_steps: rounds,
        initial_cost,
        final_cost: cost,
        termination,
    }
}
