//! 6-DOF Pose Graph Optimization.
//!
//! Distributes the correction of accepted loop closures over every keyframe
//! of the map. Landmarks are not optimized; they follow their reference
//! keyframe rigidly after the solve.
//!
//! Edges:
//! - loop edges from the map's loop constraints, weighted by the uncertainty
//!   of their translation;
//! - successor edges along each agent's trajectory;
//! - skip edges from each keyframe to up to four of its predecessors.
//!
//! Sequential edges are measured from the current map poses, so they hold the
//! local trajectory shape while the loops pull it into place.

use std::collections::{BTreeMap, HashMap, HashSet};

use nalgebra::{Matrix6, Vector3};
use tracing::{debug, info, warn};

use super::factors::BetweenFactor;
use super::manifold::{pose_from_params, pose_to_params, Manifold};
use super::problem::{ParameterBlockId, Problem};
use super::solver::{Solver, SolverSummary};
use crate::atlas::map::{KeyFrame, KeyFrameId, LandmarkId, Map};
use crate::config::OptimizerConfig;
use crate::error::{OptimizerError, OptimizerResult};
use crate::geometry::SE3;

/// Predecessors linked by skip edges.
pub(crate) const SKIP_EDGE_DEPTH: u64 = 4;

#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    pub loop_edges: usize,
    pub sequential_edges: usize,
    pub summary: SolverSummary,
}

/// Runs 6-DOF PGO on `map` and writes the corrected poses back.
///
/// `corrected_poses` overrides the initial estimate of the keyframes it names;
/// the edge measurements always come from the map.
pub fn pose_graph_optimization(
    map: &mut Map,
    corrected_poses: Option<&HashMap<KeyFrameId, SE3>>,
    config: &OptimizerConfig,
    solver: &dyn Solver,
) -> OptimizerResult<PoseGraphResult> {
    info!(
        "PGO on map {}: {} keyframes, {} loops",
        map.map_id(),
        map.num_keyframes(),
        map.loop_constraints().len()
    );

    let anchor = map.anchor_id();
    let mut problem = Problem::new();
    let mut blocks: BTreeMap<KeyFrameId, ParameterBlockId> = BTreeMap::new();
    for kf in map.keyframes().filter(|kf| !kf.is_invalid) {
        let initial = corrected_poses.and_then(|poses| poses.get(&kf.id)).unwrap_or(&kf.pose);
        let block = problem.add_parameter_block(&pose_to_params(initial), Manifold::Pose);
        if is_held_fixed(kf, anchor, config) {
            problem.set_constant(block);
        }
        blocks.insert(kf.id, block);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loop edges
    // ─────────────────────────────────────────────────────────────────────────
    let mut loop_edges = 0;
    for lc in map.loop_constraints() {
        let (Some(&b1), Some(&b2)) = (blocks.get(&lc.kf1), blocks.get(&lc.kf2)) else {
            warn!("Skipping loop {} -> {}: keyframe not in graph", lc.kf1, lc.kf2);
            continue;
        };
        let weight = config.loop_weight(lc.translation_covariance_trace());
        let factor = BetweenFactor::new(lc.t_s1_s2, Matrix6::identity() * weight);
        problem.add_residual_block(factor, None, &[b1, b2])?;
        loop_edges += 1;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Successor and skip edges
    // ─────────────────────────────────────────────────────────────────────────
    let edges = sequential_edges(map, |id| blocks.contains_key(&id));
    for &(from, to) in &edges {
        let (Some(kf_from), Some(kf_to)) = (map.get_keyframe(from), map.get_keyframe(to)) else {
            continue;
        };
        let (Some(&b_from), Some(&b_to)) = (blocks.get(&from), blocks.get(&to)) else {
            continue;
        };
        let factor = BetweenFactor::with_weights(kf_from.pose.between(&kf_to.pose), config.wt_kf_r, config.wt_kf_t);
        problem.add_residual_block(factor, None, &[b_from, b_to])?;
    }
    debug!("PGO graph: {} loop edges, {} sequential edges", loop_edges, edges.len());

    let options = config.solver_options(config.pgo_iteration_limit);
    let summary = solver.solve(&mut problem, &options);

    let corrected: BTreeMap<KeyFrameId, SE3> = blocks
        .iter()
        .map(|(id, block)| {
            let pose = match (problem.is_constant(*block), corrected_poses.and_then(|p| p.get(id))) {
                (true, None) => map.get_keyframe(*id).map_or_else(SE3::identity, |kf| kf.pose),
                _ => pose_from_params(problem.parameter_values(*block)),
            };
            (*id, pose)
        })
        .collect();
    apply_corrections(map, &corrected)?;

    info!(
        "PGO complete: {} iterations, error {:.4} -> {:.4}",
        summary.iterations, summary.initial_cost, summary.final_cost
    );
    Ok(PoseGraphResult { loop_edges, sequential_edges: edges.len(), summary })
}

/// Anchor, and keyframes frozen by the GBA / loaded-map policies.
pub(crate) fn is_held_fixed(kf: &KeyFrame, anchor: KeyFrameId, config: &OptimizerConfig) -> bool {
    kf.id == anchor
        || (kf.is_gba_optimized && config.pgo_fix_kfs_after_gba)
        || (kf.is_loaded && config.pgo_fix_poses_loaded_maps)
}

/// Ordered (from, to) pairs of successor and skip edges between keyframes
/// accepted by `in_graph`. Successor edges run `kf → successor`, skip edges
/// `kf → predecessor`, walking back while the walk index stays below the
/// keyframe's sequence index. A pair is never emitted twice.
pub(crate) fn sequential_edges(map: &Map, in_graph: impl Fn(KeyFrameId) -> bool) -> Vec<(KeyFrameId, KeyFrameId)> {
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();
    let mut edges = Vec::new();

    for kf in map.keyframes().filter(|kf| in_graph(kf.id)) {
        if let Some(succ) = kf.successor.filter(|s| in_graph(*s)) {
            if inserted.insert((kf.id, succ)) {
                edges.push((kf.id, succ));
            }
        }
    }

    for kf in map.keyframes().filter(|kf| in_graph(kf.id)) {
        let mut walk = kf.predecessor;
        for j in 1..=SKIP_EDGE_DEPTH {
            if kf.id.seq <= j {
                break;
            }
            let Some(pred) = walk else {
                break;
            };
            if in_graph(pred) && inserted.insert((kf.id, pred)) {
                edges.push((kf.id, pred));
            }
            walk = map.get_keyframe(pred).and_then(|p| p.predecessor);
        }
    }

    edges
}

/// Writes corrected poses, rotates velocities into the corrected frames and
/// moves each landmark with its reference keyframe.
///
/// Every landmark correction is computed before anything is written, so a
/// missing reference pose leaves the map untouched.
pub(crate) fn apply_corrections(map: &mut Map, corrected: &BTreeMap<KeyFrameId, SE3>) -> OptimizerResult<()> {
    let uncorrected: BTreeMap<KeyFrameId, SE3> = corrected
        .keys()
        .filter_map(|id| map.get_keyframe(*id).map(|kf| (*id, kf.pose)))
        .collect();

    let mut landmark_updates: Vec<(LandmarkId, Vector3<f64>)> = Vec::new();
    let mut skipped = 0;
    for lm in map.landmarks().filter(|lm| !lm.is_invalid) {
        let Some(ref_kf) = lm.reference_kf else {
            warn!("{} has no reference keyframe, not corrected", lm.id);
            skipped += 1;
            continue;
        };
        let (Some(t_uncorrected), Some(t_corrected)) = (uncorrected.get(&ref_kf), corrected.get(&ref_kf)) else {
            return Err(OptimizerError::MissingReferencePose { kf: ref_kf, landmark: lm.id });
        };
        let p_s = t_uncorrected.inverse().transform_point(&lm.position);
        landmark_updates.push((lm.id, t_corrected.transform_point(&p_s)));
    }

    for (id, pose) in corrected {
        let Some(kf) = map.get_keyframe_mut(*id) else {
            continue;
        };
        let r_corr = pose.rotation_matrix();
        let r_uncorr = kf.pose.rotation_matrix();
        kf.velocity = r_corr * r_uncorr.transpose() * kf.velocity;
        kf.pose = *pose;
    }

    for (id, position) in landmark_updates {
        if let Some(lm) = map.get_landmark_mut(id) {
            lm.position = position;
        }
    }
    if skipped > 0 {
        debug!("{} landmarks without reference keyframe left in place", skipped);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::atlas::map::LoopConstraint;
    use crate::optimizer::solver::{solver_for, SolverStrategy};
    use crate::optimizer::test_scenes::camera;

    const NUM_KFS: usize = 8;

    /// A square loop: the true trajectory returns near its start, the stored
    /// one drifts in yaw and x along the way.
    fn drifting_loop() -> (Map, Vec<KeyFrameId>, Vec<SE3>) {
        let truth: Vec<SE3> = (0..NUM_KFS)
            .map(|i| {
                let angle = i as f64 * std::f64::consts::TAU / NUM_KFS as f64;
                SE3::from_scaled_axis(Vector3::new(0.0, 0.0, angle), Vector3::new(angle.cos(), angle.sin(), 0.0))
            })
            .collect();

        let mut map = Map::new(0);
        let ids = truth
            .iter()
            .enumerate()
            .map(|(i, pose)| {
                let drift = SE3::from_scaled_axis(
                    Vector3::new(0.0, 0.0, 0.01 * i as f64),
                    Vector3::new(0.03 * i as f64, 0.0, 0.0),
                );
                let id = map.create_keyframe(0, i as u64, drift.compose(pose), SE3::identity(), camera(), vec![]);
                map.get_keyframe_mut(id).unwrap().velocity = Vector3::new(1.0, 0.5, 0.0);
                id
            })
            .collect::<Vec<_>>();

        let last = NUM_KFS - 1;
        let mut cov = Matrix6::identity() * 0.01;
        cov[(3, 3)] = 0.01;
        map.add_loop_constraint(LoopConstraint::new(
            ids[0],
            ids[last],
            truth[0].between(&truth[last]),
            0.0,
            cov,
        ));
        (map, ids, truth)
    }

    /// Anchor plus one keyframe of another agent, so no sequential edge links
    /// them. Two loops disagree on where the second keyframe sits.
    fn conflicting_loops(trace_a: f64, trace_b: f64) -> (Map, KeyFrameId) {
        let mut map = Map::new(0);
        let anchor = map.create_keyframe(0, 0, SE3::identity(), SE3::identity(), camera(), vec![]);
        let other = map.create_keyframe(1, 0, SE3::identity(), SE3::identity(), camera(), vec![]);
        for (translation, trace) in [(Vector3::x(), trace_a), (Vector3::y(), trace_b)] {
            map.add_loop_constraint(LoopConstraint::new(
                anchor,
                other,
                SE3::from_translation(translation),
                0.0,
                Matrix6::identity() * (trace / 3.0),
            ));
        }
        (map, other)
    }

    #[test]
    fn test_confident_loop_outweighs_uncertain_one() {
        let config = OptimizerConfig::default();
        let solver = solver_for(SolverStrategy::LevenbergMarquardt);

        let (mut map, other) = conflicting_loops(0.05, 10.0);
        let result = pose_graph_optimization(&mut map, None, &config, solver.as_ref()).unwrap();
        assert_eq!(result.loop_edges, 2);
        assert_eq!(result.sequential_edges, 0);
        let t = map.get_keyframe(other).unwrap().pose.translation;
        assert_relative_eq!(t, Vector3::x(), epsilon = 0.01);
        assert!((t - Vector3::y()).norm() > 0.5);

        let (mut map, other) = conflicting_loops(10.0, 0.05);
        pose_graph_optimization(&mut map, None, &config, solver.as_ref()).unwrap();
        let t = map.get_keyframe(other).unwrap().pose.translation;
        assert_relative_eq!(t, Vector3::y(), epsilon = 0.01);
    }

    #[test]
    fn test_loop_weight_tiers_rank_loops() {
        // 0.3 falls in the middle tier, which still dominates the last one.
        let config = OptimizerConfig::default();
        let solver = solver_for(SolverStrategy::Dogleg);
        let (mut map, other) = conflicting_loops(0.3, 10.0);
        pose_graph_optimization(&mut map, None, &config, solver.as_ref()).unwrap();
        let t = map.get_keyframe(other).unwrap().pose.translation;
        assert!((t - Vector3::x()).norm() < 0.02, "{t:?}");
    }

    #[test]
    fn test_sequential_edge_enumeration() {
        let (map, ids, _) = drifting_loop();
        let edges = sequential_edges(&map, |_| true);

        // 7 successor edges; skip edges per seq s: min(4, s - 1).
        let skip: usize = (0..NUM_KFS as u64).map(|s| s.saturating_sub(1).min(SKIP_EDGE_DEPTH) as usize).sum();
        assert_eq!(edges.len(), NUM_KFS - 1 + skip);
        assert!(edges.contains(&(ids[2], ids[3])));
        assert!(edges.contains(&(ids[3], ids[2])));
        assert!(edges.contains(&(ids[7], ids[3])));
        assert!(!edges.contains(&(ids[7], ids[2])));
        assert!(!edges.contains(&(ids[1], ids[0])));

        let unique: HashSet<_> = edges.iter().collect();
        assert_eq!(unique.len(), edges.len());
    }

    #[test]
    fn test_loop_pulls_drift_back_and_anchor_stays() {
        let (mut map, ids, truth) = drifting_loop();
        let landmark = map.create_landmark(Vector3::new(0.5, 0.5, 1.0), Some(ids[NUM_KFS - 1]));
        let last_before = map.get_keyframe(ids[NUM_KFS - 1]).unwrap().pose;
        let p_s_before = last_before.inverse().transform_point(&map.get_landmark(landmark).unwrap().position);
        let anchor_pose = map.get_keyframe(ids[0]).unwrap().pose;

        let config = OptimizerConfig::default();
        let solver = solver_for(SolverStrategy::LevenbergMarquardt);
        let result = pose_graph_optimization(&mut map, None, &config, solver.as_ref()).unwrap();

        assert_eq!(result.loop_edges, 1);
        assert!(result.summary.final_cost < result.summary.initial_cost);
        assert_eq!(map.get_keyframe(ids[0]).unwrap().pose, anchor_pose);

        let last = map.get_keyframe(ids[NUM_KFS - 1]).unwrap();
        let err_before = (truth[0].between(&last_before).translation - truth[0].between(&truth[NUM_KFS - 1]).translation).norm();
        let err_after = (anchor_pose.between(&last.pose).translation - truth[0].between(&truth[NUM_KFS - 1]).translation).norm();
        assert!(err_after < err_before);

        // The landmark moves rigidly with its reference keyframe.
        let p_s_after = last.pose.inverse().transform_point(&map.get_landmark(landmark).unwrap().position);
        assert_relative_eq!(p_s_after, p_s_before, epsilon = 1e-9);
        assert_relative_eq!(last.velocity.norm(), Vector3::new(1.0, 0.5, 0.0).norm(), epsilon = 1e-9);
    }

    #[test]
    fn test_fixed_keyframe_takes_override() {
        let (mut map, ids, _) = drifting_loop();
        map.get_keyframe_mut(ids[3]).unwrap().is_loaded = true;
        let override_pose = SE3::from_translation(Vector3::new(5.0, 5.0, 0.0));
        let overrides: HashMap<KeyFrameId, SE3> = [(ids[3], override_pose)].into_iter().collect();

        let config = OptimizerConfig { pgo_fix_poses_loaded_maps: true, ..OptimizerConfig::default() };
        let solver = solver_for(SolverStrategy::Dogleg);
        pose_graph_optimization(&mut map, Some(&overrides), &config, solver.as_ref()).unwrap();

        let pose = map.get_keyframe(ids[3]).unwrap().pose;
        assert_relative_eq!(pose.translation, override_pose.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_reference_pose_is_fatal_and_writes_nothing() {
        let (mut map, ids, _) = drifting_loop();
        map.get_keyframe_mut(ids[5]).unwrap().is_invalid = true;
        map.create_landmark(Vector3::new(0.0, 0.0, 1.0), Some(ids[5]));
        let poses: Vec<SE3> = map.keyframes().map(|kf| kf.pose).collect();

        let config = OptimizerConfig::default();
        let solver = solver_for(SolverStrategy::Dogleg);
        let err = pose_graph_optimization(&mut map, None, &config, solver.as_ref()).unwrap_err();

        assert!(matches!(err, OptimizerError::MissingReferencePose { .. }));
        assert!(err.is_fatal());
        assert_eq!(poses, map.keyframes().map(|kf| kf.pose).collect::<Vec<_>>());
    }

    #[test]
    fn test_landmark_without_reference_is_left_in_place() {
        let (mut map, _, _) = drifting_loop();
        let lm = map.create_landmark(Vector3::new(1.0, 2.0, 3.0), None);
        let config = OptimizerConfig::default();
        let solver = solver_for(SolverStrategy::Dogleg);
        pose_graph_optimization(&mut map, None, &config, solver.as_ref()).unwrap();
        assert_eq!(map.get_landmark(lm).unwrap().position, Vector3::new(1.0, 2.0, 3.0));
    }
}
