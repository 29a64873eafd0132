//! Optimization engine of the collaborative backend.
//!
//! Implements, on top of a shared problem arena and solver:
//! - Global Bundle Adjustment with outlier pruning ([`global_ba`])
//! - Window Bundle Adjustment for merge verification ([`local_ba`])
//! - Two-view registration refinement ([`relative_pose`])
//! - 6-DOF and 4-DOF Pose Graph Optimization ([`pose_graph`], [`pose_graph_4dof`])
//!
//! [`Optimizer`] bundles a configuration, a solver and an optional diagnostics
//! sink so callers do not thread them through every call.

pub mod diagnostics;
pub mod factors;
pub mod global_ba;
pub mod local_ba;
pub mod loss;
pub mod manifold;
pub mod pose_graph;
pub mod pose_graph_4dof;
pub mod problem;
pub mod problem_builder;
pub mod relative_pose;
pub mod solver;

#[cfg(test)]
pub(crate) mod test_scenes;

use std::collections::HashMap;
use std::sync::Arc;

pub use diagnostics::{CsvDiagnosticsSink, DiagnosticsSink, MemoryDiagnosticsSink};
pub use global_ba::{global_bundle_adjustment, GlobalBAParams, GlobalBAResult};
pub use local_ba::{local_bundle_adjustment, LocalBAResult, LocalLandmark};
pub use pose_graph::{pose_graph_optimization, PoseGraphResult};
pub use pose_graph_4dof::pose_graph_optimization_4dof;
pub use relative_pose::optimize_relative_pose;
pub use solver::{solver_for, Solver, SolverOptions, SolverStrategy, SolverSummary, Termination};

use crate::atlas::map::{KeyFrameId, LandmarkId, Map};
use crate::config::OptimizerConfig;
use crate::error::OptimizerResult;
use crate::geometry::SE3;

pub struct Optimizer {
    config: OptimizerConfig,
    solver: Box<dyn Solver>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl Optimizer {
    /// Uses the built-in solver for `config.strategy`.
    pub fn new(config: OptimizerConfig) -> Self {
        let solver = solver_for(config.strategy);
        Self { config, solver, diagnostics: None }
    }

    pub fn with_solver(mut self, solver: Box<dyn Solver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn global_bundle_adjustment(&self, map: &mut Map, params: &GlobalBAParams) -> OptimizerResult<GlobalBAResult> {
        global_bundle_adjustment(map, &self.config, self.solver.as_ref(), params)
    }

    pub fn local_bundle_adjustment(
        &self,
        map: &Map,
        landmarks: &[LocalLandmark],
        query: &[KeyFrameId],
        candidate: &[KeyFrameId],
        t_s1s2: &SE3,
    ) -> OptimizerResult<LocalBAResult> {
        local_bundle_adjustment(
            map,
            landmarks,
            query,
            candidate,
            t_s1s2,
            &self.config,
            self.solver.as_ref(),
            self.diagnostics.as_deref(),
        )
    }

    /// Two-view refinement with the configured outlier threshold.
    pub fn optimize_relative_pose(
        &self,
        map: &Map,
        kf1: KeyFrameId,
        kf2: KeyFrameId,
        matches: &mut [Option<LandmarkId>],
        t_12: &mut SE3,
    ) -> OptimizerResult<usize> {
        optimize_relative_pose(
            map,
            kf1,
            kf2,
            matches,
            t_12,
            self.config.relative_pose_outlier_threshold,
            &self.config,
            self.solver.as_ref(),
        )
    }

    pub fn pose_graph_optimization(
        &self,
        map: &mut Map,
        corrected_poses: Option<&HashMap<KeyFrameId, SE3>>,
    ) -> OptimizerResult<PoseGraphResult> {
        pose_graph_optimization(map, corrected_poses, &self.config, self.solver.as_ref())
    }

    pub fn pose_graph_optimization_4dof(&self, map: &mut Map) -> OptimizerResult<PoseGraphResult> {
        pose_graph_optimization_4dof(map, &self.config, self.solver.as_ref())
    }
}
