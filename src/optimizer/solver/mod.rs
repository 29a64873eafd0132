//! Nonlinear least-squares solvers.
//!
//! Every optimizer talks to a [`Solver`]: it hands over a fully-built
//! [`Problem`] and an iteration budget and gets the problem back at the best
//! estimate found. Running out of iterations is a normal outcome and is
//! reported in the [`SolverSummary`], never as an error.

mod minpack;
mod trust_region;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::problem::Problem;

pub use minpack::MinpackSolver;
pub use trust_region::TrustRegionSolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStrategy {
    LevenbergMarquardt,
    /// Powell's dogleg.
    Dogleg,
    /// MINPACK-style Levenberg-Marquardt from the `levenberg-marquardt` crate.
    Minpack,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub num_threads: usize,
    pub strategy: SolverStrategy,
    /// Stop when a step decreases the cost by less than this fraction.
    pub function_tolerance: f64,
    /// Stop when the largest gradient component falls below this.
    pub gradient_tolerance: f64,
    /// Stop when the step is this small relative to the parameters.
    pub parameter_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            num_threads: 1,
            strategy: SolverStrategy::Dogleg,
            function_tolerance: 1e-6,
            gradient_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Converged,
    MaxIterations,
    /// Nothing to optimize: every block is constant or there are no residuals.
    NoFreeParameters,
    /// The linear system could not be solved; the best estimate so far is kept.
    NumericalFailure,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverSummary {
    pub iterations: usize,
    pub successful_steps: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub termination: Termination,
}

impl SolverSummary {
    pub(crate) fn trivial(cost: f64) -> Self {
        Self {
            iterations: 0,
            successful_steps: 0,
            initial_cost: cost,
            final_cost: cost,
            termination: Termination::NoFreeParameters,
        }
    }
}

pub trait Solver: Send + Sync {
    /// Minimizes the robust cost of `problem` in place. The final cost never
    /// exceeds the initial one.
    fn solve(&self, problem: &mut Problem, options: &SolverOptions) -> SolverSummary;
}

/// The built-in solver for a strategy.
pub fn solver_for(strategy: SolverStrategy) -> Box<dyn Solver> {
    match strategy {
        SolverStrategy::LevenbergMarquardt | SolverStrategy::Dogleg => {
            Box::new(TrustRegionSolver::new(strategy))
        }
        SolverStrategy::Minpack => Box::new(MinpackSolver),
    }
}

/// Runs `f` on a dedicated rayon pool with `num_threads` workers, or on the
/// calling thread's pool if one cannot be built.
pub(crate) fn with_thread_pool<R: Send>(num_threads: usize, f: impl FnOnce() -> R + Send) -> R {
    match rayon::ThreadPoolBuilder::new().num_threads(num_threads.max(1)).build() {
        Ok(pool) => pool.install(f),
        Err(err) => {
            warn!("Could not build solver thread pool ({err}), using the global pool");
            f()
        }
    }
}
