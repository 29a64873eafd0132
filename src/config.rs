//! Optimizer configuration.
//!
//! All numeric policies of the engine live here. Every field has a default, so a
//! YAML file only needs to name the values it overrides:
//!
//! ```yaml
//! num_threads: 8
//! strategy: levenberg_marquardt
//! gba_outlier_threshold: 3.0
//! ```

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OptimizerResult;
use crate::optimizer::solver::{SolverOptions, SolverStrategy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Threads used to evaluate residuals and Jacobians.
    pub num_threads: usize,
    /// Trust-region strategy of the built-in solver.
    pub strategy: SolverStrategy,

    /// Default iteration cap of the second GBA pass.
    pub gba_iteration_limit: usize,
    /// Iteration cap of both pose-graph variants.
    pub pgo_iteration_limit: usize,
    /// Iteration cap of the merge-verification window BA.
    pub lba_iteration_limit: usize,
    /// Iterations of the GBA outlier pass and of each two-view pass.
    pub outlier_pass_iterations: usize,

    /// Sigma-weighted reprojection norm above which GBA drops an observation.
    pub gba_outlier_threshold: f64,
    /// Sigma-weighted reprojection norm above which the two-view refiner drops
    /// a correspondence.
    pub relative_pose_outlier_threshold: f64,
    /// Minimum surviving correspondences for the two-view refiner to accept.
    pub min_relative_pose_inliers: usize,

    /// Trace of the loop translation covariance below which the loop gets
    /// `wt_lp_r1`.
    pub cov_switch: f64,
    /// Trace below which the loop gets `wt_lp_r2`; above it gets `wt_lp_r3`.
    pub cov_switch2: f64,
    pub wt_lp_r1: f64,
    pub wt_lp_r2: f64,
    pub wt_lp_r3: f64,
    /// Rotation weight of successor and skip edges.
    pub wt_kf_r: f64,
    /// Translation weight of successor and skip edges.
    pub wt_kf_t: f64,

    /// Hold keyframes already refined by GBA fixed during PGO.
    pub pgo_fix_kfs_after_gba: bool,
    /// Hold keyframes of loaded maps fixed during PGO.
    pub pgo_fix_poses_loaded_maps: bool,
    /// Hold keyframes of loaded maps fixed during the second GBA pass.
    pub gba_fix_poses_loaded_maps: bool,
    /// Add the map's loop constraints to the second GBA pass.
    pub gba_use_map_loop_constraints: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            strategy: SolverStrategy::Dogleg,
            gba_iteration_limit: 15,
            pgo_iteration_limit: 50,
            lba_iteration_limit: 10_000,
            outlier_pass_iterations: 5,
            gba_outlier_threshold: 2.5,
            relative_pose_outlier_threshold: 2.5,
            min_relative_pose_inliers: 12,
            cov_switch: 0.2,
            cov_switch2: 0.5,
            wt_lp_r1: 0.5,
            wt_lp_r2: 0.1,
            wt_lp_r3: 0.01,
            wt_kf_r: 1.0,
            wt_kf_t: 1.0,
            pgo_fix_kfs_after_gba: false,
            pgo_fix_poses_loaded_maps: false,
            gba_fix_poses_loaded_maps: false,
            gba_use_map_loop_constraints: true,
        }
    }
}

impl OptimizerConfig {
    pub fn from_yaml_str(yaml: &str) -> OptimizerResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> OptimizerResult<Self> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Solver options for a solve capped at `max_iterations`.
    pub fn solver_options(&self, max_iterations: usize) -> SolverOptions {
        SolverOptions {
            max_iterations,
            num_threads: self.num_threads,
            strategy: self.strategy,
            ..SolverOptions::default()
        }
    }

    /// Loop-edge weight from the trace of the loop's translation covariance.
    ///
    /// Three tiers: below `cov_switch`, below `cov_switch2`, and everything
    /// else (including NaN traces).
    pub fn loop_weight(&self, translation_cov_trace: f64) -> f64 {
        if translation_cov_trace < self.cov_switch {
            self.wt_lp_r1
        } else if translation_cov_trace < self.cov_switch2 {
            self.wt_lp_r2
        } else {
            self.wt_lp_r3
        }
    }
}
