//! Dense trust-region solver (Levenberg-Marquardt and Powell's dogleg).
//!
//! Each iteration linearizes the loss-corrected problem, forms the normal
//! equations `JᵀJ δ = −Jᵀr` and proposes a step. A step is kept only if it
//! lowers the robust cost, so the cost is monotonically non-increasing.

use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

use super::{with_thread_pool, Solver, SolverOptions, SolverStrategy, SolverSummary, Termination};
use crate::optimizer::problem::{ColumnLayout, LossMode, Problem};

const INITIAL_LAMBDA: f64 = 1e-3;
const MIN_LAMBDA: f64 = 1e-10;
const MAX_LAMBDA: f64 = 1e10;

const INITIAL_RADIUS: f64 = 1e4;
const MIN_RADIUS: f64 = 1e-32;

/// Regularization of the dogleg Gauss-Newton system, relative to its diagonal.
const DOGLEG_DIAGONAL_FLOOR: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct TrustRegionSolver {
    strategy: SolverStrategy,
}

impl TrustRegionSolver {
    /// `Minpack` is not a trust-region strategy and falls back to dogleg.
    pub fn new(strategy: SolverStrategy) -> Self {
        let strategy = match strategy {
            SolverStrategy::Minpack => SolverStrategy::Dogleg,
            other => other,
        };
        Self { strategy }
    }
}

impl Solver for TrustRegionSolver {
    fn solve(&self, problem: &mut Problem, options: &SolverOptions) -> SolverSummary {
        let layout = problem.free_layout();
        if layout.num_columns() == 0 || problem.num_residual_blocks() == 0 {
            return SolverSummary::trivial(problem.cost());
        }
        let strategy = self.strategy;
        with_thread_pool(options.num_threads, || run(problem, &layout, options, strategy))
    }
}

/// Damping state carried across iterations.
enum Region {
    Lambda(f64),
    Radius(f64),
}

impl Region {
    fn shrink(&mut self) {
        match self {
            Region::Lambda(lambda) => *lambda = (*lambda * 10.0).min(MAX_LAMBDA),
            Region::Radius(radius) => *radius = (*radius * 0.5).max(MIN_RADIUS),
        }
    }

    fn is_exhausted(&self) -> bool {
        match self {
            Region::Lambda(lambda) => *lambda >= MAX_LAMBDA,
            Region::Radius(radius) => *radius <= MIN_RADIUS,
        }
    }
}

fn run(problem: &mut Problem, layout: &ColumnLayout, options: &SolverOptions, strategy: SolverStrategy) -> SolverSummary {
    let initial_cost = problem.cost();
    let mut cost = initial_cost;
    let mut region = match strategy {
        SolverStrategy::LevenbergMarquardt => Region::Lambda(INITIAL_LAMBDA),
        _ => Region::Radius(INITIAL_RADIUS),
    };

    let mut lin = problem.linearize(layout, LossMode::Corrected);
    let mut iterations = 0;
    let mut successful_steps = 0;
    let mut termination = Termination::MaxIterations;

    for iter in 0..options.max_iterations {
        iterations = iter + 1;

        let gradient = lin.jacobian.transpose() * &lin.residuals;
        if gradient.amax() < options.gradient_tolerance {
            termination = Termination::Converged;
            break;
        }
        let jtj = lin.jacobian.transpose() * &lin.jacobian;

        let step = match &region {
            Region::Lambda(lambda) => levenberg_marquardt_step(&jtj, &gradient, *lambda),
            Region::Radius(radius) => Some(dogleg_step(&lin.jacobian, &jtj, &gradient, *radius)),
        };
        let Some(step) = step else {
            region.shrink();
            if region.is_exhausted() {
                termination = Termination::NumericalFailure;
                break;
            }
            continue;
        };

        if step.norm() < options.parameter_tolerance {
            termination = Termination::Converged;
            break;
        }

        let saved = problem.snapshot();
        problem.apply_step(layout, &step);
        let new_cost = problem.cost();

        if new_cost.is_finite() && new_cost < cost {
            trace!(iter, cost, new_cost, "step accepted");
            let actual_decrease = cost - new_cost;
            let relative_decrease = actual_decrease / cost.max(f64::MIN_POSITIVE);
            cost = new_cost;
            successful_steps += 1;

            match &mut region {
                Region::Lambda(lambda) => *lambda = (*lambda * 0.1).max(MIN_LAMBDA),
                Region::Radius(radius) => {
                    let predicted = -(gradient.dot(&step) + 0.5 * step.dot(&(&jtj * &step)));
                    let ratio = actual_decrease / predicted.max(f64::MIN_POSITIVE);
                    if ratio > 0.75 {
                        *radius = radius.max(3.0 * step.norm());
                    } else if ratio < 0.25 {
                        *radius = (*radius * 0.5).max(MIN_RADIUS);
                    }
                }
            }

            if relative_decrease < options.function_tolerance {
                termination = Termination::Converged;
                break;
            }
            lin = problem.linearize(layout, LossMode::Corrected);
        } else {
            problem.restore(&saved);
            region.shrink();
            if region.is_exhausted() {
                termination = Termination::NumericalFailure;
                break;
            }
        }
    }

    debug!(
        iterations,
        successful_steps,
        initial_cost,
        final_cost = cost,
        ?termination,
        "trust region solve finished"
    );

    SolverSummary {
        iterations,
        successful_steps,
        initial_cost,
        final_cost: cost,
        termination,
    }
}

/// Solves `(JᵀJ + λ·diag(JᵀJ)) δ = −g`.
fn levenberg_marquardt_step(jtj: &DMatrix<f64>, gradient: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
    let mut damped = jtj.clone();
    for i in 0..damped.nrows() {
        damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
    }
    let step = damped.lu().solve(&(-gradient))?;
    step.iter().all(|v| v.is_finite()).then_some(step)
}

/// Powell's dogleg inside a trust region of `radius`.
fn dogleg_step(jacobian: &DMatrix<f64>, jtj: &DMatrix<f64>, gradient: &DVector<f64>, radius: f64) -> DVector<f64> {
    let mut regularized = jtj.clone();
    for i in 0..regularized.nrows() {
        regularized[(i, i)] += DOGLEG_DIAGONAL_FLOOR * regularized[(i, i)].max(1e-6);
    }
    let gauss_newton = regularized
        .lu()
        .solve(&(-gradient))
        .filter(|s| s.iter().all(|v| v.is_finite()));

    if let Some(gn) = &gauss_newton {
        if gn.norm() <= radius {
            return gn.clone();
        }
    }

    // Cauchy point: minimizer of the model along the steepest descent.
    let g_norm_sq = gradient.norm_squared();
    let jg_norm_sq = (jacobian * gradient).norm_squared();
    let alpha = if jg_norm_sq > 0.0 { g_norm_sq / jg_norm_sq } else { 1.0 };
    let steepest = -gradient * alpha;
    let steepest_norm = steepest.norm();

    let Some(gn) = gauss_newton else {
        return if steepest_norm > radius { &steepest * (radius / steepest_norm) } else { steepest };
    };
    if steepest_norm >= radius {
        return &steepest * (radius / steepest_norm);
    }

    // Point where the segment steepest → gn leaves the region.
    let diff = &gn - &steepest;
    let a = diff.norm_squared();
    let b = 2.0 * steepest.dot(&diff);
    let c = steepest_norm * steepest_norm - radius * radius;
    let beta = (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a);
    steepest + diff * beta
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dogleg_takes_gauss_newton_inside_region() {
        let jacobian = DMatrix::identity(2, 2);
        let jtj = DMatrix::identity(2, 2);
        let gradient = DVector::from_vec(vec![1.0, -2.0]);
        let step = dogleg_step(&jacobian, &jtj, &gradient, 10.0);
        assert_relative_eq!(step, -gradient, epsilon = 1e-6);
    }

    #[test]
    fn test_dogleg_respects_radius() {
        let jacobian = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 10.0]);
        let jtj = jacobian.transpose() * &jacobian;
        let gradient = DVector::from_vec(vec![3.0, 4.0]);
        for radius in [0.01, 0.5, 2.0] {
            let step = dogleg_step(&jacobian, &jtj, &gradient, radius);
            assert!(step.norm() <= radius + 1e-9);
            assert!(gradient.dot(&step) < 0.0);
        }
    }

    #[test]
    fn test_lm_step_is_descent_direction() {
        let jtj = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let gradient = DVector::from_vec(vec![1.0, 2.0]);
        let step = levenberg_marquardt_step(&jtj, &gradient, 1e-3).unwrap();
        assert!(gradient.dot(&step) < 0.0);
    }

    #[test]
    fn test_minpack_strategy_maps_to_dogleg() {
        let solver = TrustRegionSolver::new(SolverStrategy::Minpack);
        assert_eq!(solver.strategy, SolverStrategy::Dogleg);
    }
}
