//! 4-DOF Pose Graph Optimization for visual-inertial maps.
//!
//! With gravity observable, pitch and roll of every keyframe are known and
//! only yaw and translation drift. Each keyframe gets a yaw block on the
//! angle manifold and a translation block; pitch and roll are read once when
//! the graph is built and baked into the edges and the write-back.
//!
//! Loop edges carry the loop measurement with a covariance-tiered weight and a
//! Huber loss. Successor and skip edges are unweighted and measured from the
//! current map poses.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use super::factors::FourDofFactor;
use super::loss::{HuberLoss, Loss};
use super::manifold::Manifold;
use super::pose_graph::{apply_corrections, is_held_fixed, sequential_edges, PoseGraphResult};
use super::problem::{ParameterBlockId, Problem};
use super::solver::Solver;
use crate::atlas::map::{KeyFrameId, Map};
use crate::config::OptimizerConfig;
use crate::error::OptimizerResult;
use crate::geometry::{rotation_to_ypr, ypr_to_rotation, SE3};

const LOOP_LOSS_SCALE: f64 = 0.1;

/// Staged blocks and the attitude captured at build time.
#[derive(Debug, Clone, Copy)]
struct FourDofNode {
    yaw: ParameterBlockId,
    translation: ParameterBlockId,
    pitch: f64,
    roll: f64,
    fixed: bool,
}

/// Runs 4-DOF PGO on `map` and writes the corrected poses back.
pub fn pose_graph_optimization_4dof(
    map: &mut Map,
    config: &OptimizerConfig,
    solver: &dyn Solver,
) -> OptimizerResult<PoseGraphResult> {
    info!(
        "4-DOF PGO on map {}: {} keyframes, {} loops",
        map.map_id(),
        map.num_keyframes(),
        map.loop_constraints().len()
    );

    let anchor = map.anchor_id();
    let mut problem = Problem::new();
    let mut nodes: BTreeMap<KeyFrameId, FourDofNode> = BTreeMap::new();
    for kf in map.keyframes().filter(|kf| !kf.is_invalid) {
        let ypr = rotation_to_ypr(&kf.pose.rotation);
        let yaw = problem.add_parameter_block(&[ypr.x], Manifold::Angle);
        let translation = problem.add_parameter_block(kf.pose.translation.as_slice(), Manifold::Euclidean);
        let fixed = is_held_fixed(kf, anchor, config);
        if fixed {
            problem.set_constant(yaw);
            problem.set_constant(translation);
        }
        nodes.insert(kf.id, FourDofNode { yaw, translation, pitch: ypr.y, roll: ypr.z, fixed });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loop edges
    // ─────────────────────────────────────────────────────────────────────────
    let loss: Arc<dyn Loss> = Arc::new(HuberLoss::new(LOOP_LOSS_SCALE)?);
    let mut loop_edges = 0;
    for lc in map.loop_constraints() {
        let (Some(n1), Some(n2)) = (nodes.get(&lc.kf1), nodes.get(&lc.kf2)) else {
            warn!("Skipping loop {} -> {}: keyframe not in graph", lc.kf1, lc.kf2);
            continue;
        };
        let weight = config.loop_weight(lc.translation_covariance_trace());
        let factor = FourDofFactor::weighted(lc.t_s1_s2.translation, lc.relative_yaw, n1.pitch, n1.roll, weight);
        problem.add_residual_block(
            factor,
            Some(Arc::clone(&loss)),
            &[n1.yaw, n1.translation, n2.yaw, n2.translation],
        )?;
        loop_edges += 1;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Successor and skip edges
    // ─────────────────────────────────────────────────────────────────────────
    let edges = sequential_edges(map, |id| nodes.contains_key(&id));
    for &(from, to) in &edges {
        let (Some(kf_from), Some(kf_to)) = (map.get_keyframe(from), map.get_keyframe(to)) else {
            continue;
        };
        let (Some(n_from), Some(n_to)) = (nodes.get(&from), nodes.get(&to)) else {
            continue;
        };
        let relative_t = kf_from.pose.between(&kf_to.pose).translation;
        let relative_yaw = problem.parameter_values(n_to.yaw)[0] - problem.parameter_values(n_from.yaw)[0];
        let factor = FourDofFactor::new(relative_t, relative_yaw, n_from.pitch, n_from.roll);
        problem.add_residual_block(
            factor,
            None,
            &[n_from.yaw, n_from.translation, n_to.yaw, n_to.translation],
        )?;
    }
    debug!("4-DOF graph: {} loop edges, {} sequential edges", loop_edges, edges.len());

    let options = config.solver_options(config.pgo_iteration_limit);
    let summary = solver.solve(&mut problem, &options);

    let corrected: BTreeMap<KeyFrameId, SE3> = nodes
        .iter()
        .filter_map(|(id, node)| {
            let kf = map.get_keyframe(*id)?;
            if node.fixed {
                return Some((*id, kf.pose));
            }
            let yaw = problem.parameter_values(node.yaw)[0];
            let translation = Vector3::from_column_slice(problem.parameter_values(node.translation));
            Some((*id, SE3::new(ypr_to_rotation(yaw, node.pitch, node.roll), translation)))
        })
        .collect();
    apply_corrections(map, &corrected)?;

    info!(
        "4-DOF PGO complete: {} iterations, error {:.4} -> {:.4}",
        summary.iterations, summary.initial_cost, summary.final_cost
    );
    Ok(PoseGraphResult { loop_edges, sequential_edges: edges.len(), summary })
}
