//! Global Bundle Adjustment over a whole (possibly merged) map.
//!
//! Refines every valid keyframe pose, and optionally velocities and IMU
//! biases, together with every landmark seen often enough. The optimization
//! runs in two passes:
//!
//! - PASS 1 (optional): solve briefly with robust reprojection residuals, then
//!   drop every observation whose σ-weighted reprojection error is still above
//!   the outlier threshold. Dropped observations are erased from the map for
//!   good.
//! - PASS 2: rebuild from the pruned observations, solve with the caller's
//!   iteration cap and write the result back into the map.
//!
//! Structural errors abort before anything is written back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::loss::{CauchyLoss, Loss};
use super::problem_builder::{ba_between_factor, LandmarkStaging, ProblemBuilder, StagingPolicy};
use super::solver::{Solver, SolverSummary};
use crate::atlas::map::{CleanReport, KeyFrameId, Map};
use crate::config::OptimizerConfig;
use crate::error::OptimizerResult;

/// Scale of the Cauchy loss on reprojection and map loop residuals.
const REPROJECTION_LOSS_SCALE: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
pub struct GlobalBAParams {
    /// Iteration cap of the second pass.
    pub iteration_limit: usize,
    /// Wall-clock budget. Only reported, never enforced.
    pub time_limit: Option<Duration>,
    /// Leave velocities, biases and IMU factors out.
    pub visual_only: bool,
    /// Run the outlier pass first.
    pub outlier_removal: bool,
    /// Free the bias blocks. Ignored when `visual_only`.
    pub estimate_bias: bool,
}

impl GlobalBAParams {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self {
            iteration_limit: config.gba_iteration_limit,
            time_limit: None,
            visual_only: false,
            outlier_removal: true,
            estimate_bias: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalBAResult {
    pub included_landmarks: usize,
    pub excluded_landmarks: usize,
    pub imu_factors: usize,
    pub loop_edges: usize,
    /// Reprojection residuals evaluated by the outlier pass.
    pub observations_checked: usize,
    pub outliers_removed: usize,
    pub summary: SolverSummary,
    pub cleaned: CleanReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Outlier,
    Refine,
}

/// A staged problem and what went into it.
struct GlobalProblem {
    builder: ProblemBuilder,
    landmarks: LandmarkStaging,
    imu_factors: usize,
    loop_edges: usize,
}

/// Runs global bundle adjustment on `map` and writes the result back.
pub fn global_bundle_adjustment(
    map: &mut Map,
    config: &OptimizerConfig,
    solver: &dyn Solver,
    params: &GlobalBAParams,
) -> OptimizerResult<GlobalBAResult> {
    let start = Instant::now();
    info!(
        "Global BA on map {}: {} keyframes, {} landmarks, {} loops",
        map.map_id(),
        map.num_keyframes(),
        map.num_landmarks(),
        map.loop_constraints().len()
    );

    // ─────────────────────────────────────────────────────────────────────────
    // PASS 1: robust solve and outlier pruning
    // ─────────────────────────────────────────────────────────────────────────
    let (observations_checked, outliers_removed) = if params.outlier_removal {
        remove_outliers(map, config, solver, params)?
    } else {
        (0, 0)
    };

    // ─────────────────────────────────────────────────────────────────────────
    // PASS 2: refine
    // ─────────────────────────────────────────────────────────────────────────
    let mut staged = build_problem(map, config, params, Pass::Refine)?;
    log_observation_counts(&staged.landmarks);

    let options = config.solver_options(params.iteration_limit);
    let summary = solver.solve(staged.builder.problem_mut(), &options);

    write_back(map, &staged.builder, params);
    let cleaned = map.clean();

    let elapsed = start.elapsed();
    if params.time_limit.is_some_and(|limit| elapsed > limit) {
        warn!("Global BA exceeded its time budget: {:.2?}", elapsed);
    }
    info!(
        "Global BA complete: {} iterations in {:.2?}, error {:.4} -> {:.4} ({:?})",
        summary.iterations, elapsed, summary.initial_cost, summary.final_cost, summary.termination
    );

    Ok(GlobalBAResult {
        included_landmarks: staged.landmarks.included,
        excluded_landmarks: staged.landmarks.excluded,
        imu_factors: staged.imu_factors,
        loop_edges: staged.loop_edges,
        observations_checked,
        outliers_removed,
        summary,
        cleaned,
    })
}

/// Returns (observations checked, observations removed).
fn remove_outliers(
    map: &mut Map,
    config: &OptimizerConfig,
    solver: &dyn Solver,
    params: &GlobalBAParams,
) -> OptimizerResult<(usize, usize)> {
    let mut staged = build_problem(map, config, params, Pass::Outlier)?;
    let options = config.solver_options(config.outlier_pass_iterations);
    let summary = solver.solve(staged.builder.problem_mut(), &options);
    debug!("GBA outlier pass: error {:.4} -> {:.4}", summary.initial_cost, summary.final_cost);

    let mut removed = 0;
    for edge in &staged.landmarks.edges {
        let Some(residual) = staged.builder.problem().evaluate_residual(edge.residual) else {
            continue;
        };
        if residual.norm() <= config.gba_outlier_threshold {
            continue;
        }
        staged.builder.problem_mut().remove_residual_block(edge.residual);
        map.erase_observation(edge.keyframe, edge.feature_idx);
        removed += 1;
    }

    info!(
        "GBA outlier pass removed {} of {} observations",
        removed,
        staged.landmarks.edges.len()
    );
    Ok((staged.landmarks.edges.len(), removed))
}

fn build_problem(
    map: &mut Map,
    config: &OptimizerConfig,
    params: &GlobalBAParams,
    pass: Pass,
) -> OptimizerResult<GlobalProblem> {
    let policy = StagingPolicy {
        inertial: !params.visual_only,
        estimate_bias: params.estimate_bias,
        fix_loaded: pass == Pass::Refine && config.gba_fix_poses_loaded_maps,
        fix_gba_optimized: false,
    };
    let loss: Arc<dyn Loss> = Arc::new(CauchyLoss::new(REPROJECTION_LOSS_SCALE)?);

    let mut builder = ProblemBuilder::new();
    builder.stage_map_keyframes(map, &policy)?;
    let landmarks = builder.stage_map_landmarks(map, Some(Arc::clone(&loss)))?;

    let loop_loss = match pass {
        Pass::Outlier => Some(None),
        Pass::Refine if config.gba_use_map_loop_constraints => Some(Some(loss)),
        Pass::Refine => None,
    };
    let mut loop_edges = 0;
    if let Some(loop_loss) = loop_loss {
        for lc in map.loop_constraints() {
            if !builder.is_staged(lc.kf1) || !builder.is_staged(lc.kf2) {
                warn!("Skipping loop {} -> {}: keyframe not in problem", lc.kf1, lc.kf2);
                continue;
            }
            builder.add_between(lc.kf1, lc.kf2, ba_between_factor(lc.t_s1_s2), loop_loss.clone())?;
            loop_edges += 1;
        }
    }

    let imu_factors = if params.visual_only { 0 } else { builder.add_imu_factors(map)? };

    debug!(
        "GBA {:?} problem: {} landmarks in, {} out, {} reprojections, {} IMU factors, {} loop edges",
        pass,
        landmarks.included,
        landmarks.excluded,
        landmarks.edges.len(),
        imu_factors,
        loop_edges
    );

    Ok(GlobalProblem { builder, landmarks, imu_factors, loop_edges })
}

fn write_back(map: &mut Map, builder: &ProblemBuilder, params: &GlobalBAParams) {
    for kf in map.keyframes_mut().filter(|kf| !kf.is_invalid) {
        let Some(staged) = builder.keyframe(kf.id) else {
            continue;
        };
        if !builder.problem().is_constant(staged.pose) {
            if let Some(pose) = builder.pose(kf.id) {
                kf.pose = pose;
            }
        }
        kf.pose_optimized = true;
        kf.is_gba_optimized = true;

        if !params.visual_only {
            if let Some(velocity) = builder.velocity(kf.id) {
                kf.velocity = velocity;
            }
            if let Some(bias) = builder.bias(kf.id) {
                kf.imu_bias = bias;
            }
            kf.vel_bias_optimized = true;
        }
    }

    for (lm_id, _) in builder.staged_landmarks() {
        let (Some(position), Some(lm)) = (builder.landmark_position(*lm_id), map.get_landmark_mut(*lm_id)) else {
            continue;
        };
        lm.position = position;
        lm.is_optimized = true;
        lm.is_gba_optimized = true;
    }
}

fn log_observation_counts(staging: &LandmarkStaging) {
    let mut counts: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
    for edge in &staging.edges {
        *counts.entry(edge.keyframe).or_default() += 1;
    }
    for (kf_id, count) in counts {
        debug!("{}: {} observations in GBA", kf_id, count);
    }
}
