//! Window Bundle Adjustment for map-merge verification.
//!
//! Two keyframe windows, one from the query map and one from the merge
//! candidate, observe a common set of landmarks. The problem lives in a local
//! frame anchored at the first query keyframe:
//!
//! - query keyframe `i` starts at `T_s_q0⁻¹ · T_ws_i`;
//! - candidate keyframe `i` starts at `T_s1s2 · T_s_c0⁻¹ · T_ws_i`.
//!
//! Each window is held together by between edges from its anchor, measured
//! from the current map poses. After the solve, the local pose of the
//! candidate anchor is the refined `T_s1s2`, and its 6×6 marginal covariance
//! is recovered from the pseudoinverse of `JᵀJ`.
//!
//! The map is only read.

use std::collections::HashSet;
use std::sync::Arc;

use nalgebra::{DMatrix, Matrix6, Vector3};
use tracing::{debug, info};

use super::diagnostics::{record_or_warn, DiagnosticsSink};
use super::loss::{CauchyLoss, Loss};
use super::manifold::Manifold;
use super::problem::{LossMode, ParameterBlockId};
use super::problem_builder::{ba_between_factor, ProblemBuilder, StagingPolicy};
use super::solver::{Solver, SolverSummary};
use crate::atlas::map::{KeyFrameId, Map};
use crate::config::OptimizerConfig;
use crate::error::{OptimizerError, OptimizerResult};
use crate::geometry::SE3;

/// Singular values below this fraction are dropped from the pseudoinverse.
const PSEUDO_INVERSE_EPS: f64 = 1e-12;

/// A landmark of the merge window.
#[derive(Debug, Clone)]
pub struct LocalLandmark {
    /// Position in the local frame (first query keyframe).
    pub position: Vector3<f64>,
    /// (keyframe, index into its `additional_keypoints`).
    pub observations: Vec<(KeyFrameId, usize)>,
}

#[derive(Debug, Clone)]
pub struct LocalBAResult {
    /// Refined query sensor ← candidate sensor transform.
    pub t_s1s2: SE3,
    /// Covariance of `t_s1s2`, rotation block first.
    pub covariance: Matrix6<f64>,
    /// Refined local positions, in input order.
    pub landmark_positions: Vec<Vector3<f64>>,
    pub summary: SolverSummary,
}

/// Refines the relative transform between a query and a candidate window.
#[allow(clippy::too_many_arguments)]
pub fn local_bundle_adjustment(
    map: &Map,
    landmarks: &[LocalLandmark],
    query: &[KeyFrameId],
    candidate: &[KeyFrameId],
    t_s1s2: &SE3,
    config: &OptimizerConfig,
    solver: &dyn Solver,
    diagnostics: Option<&dyn DiagnosticsSink>,
) -> OptimizerResult<LocalBAResult> {
    let (Some(&q0), Some(&c0)) = (query.first(), candidate.first()) else {
        return Err(OptimizerError::InvalidWindow("query and candidate windows must not be empty".to_string()));
    };
    let mut seen = HashSet::new();
    if let Some(dup) = query.iter().chain(candidate).find(|id| !seen.insert(**id)) {
        return Err(OptimizerError::InvalidWindow(format!("{dup} appears twice")));
    }

    info!(
        "Window BA: {} query, {} candidate keyframes, {} landmarks",
        query.len(),
        candidate.len(),
        landmarks.len()
    );

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframes in the local frame
    // ─────────────────────────────────────────────────────────────────────────
    let t_q0_inv = map_pose(map, q0)?.inverse();
    let t_c0_inv = map_pose(map, c0)?.inverse();
    let to_candidate_local = t_s1s2.compose(&t_c0_inv);

    let policy = StagingPolicy::default();
    let mut builder = ProblemBuilder::new();
    for &id in query {
        let kf = map.get_keyframe(id).ok_or(OptimizerError::UnknownKeyFrame(id))?;
        builder.stage_keyframe(kf, &t_q0_inv.compose(&kf.pose), id == q0, &policy)?;
    }
    for &id in candidate {
        let kf = map.get_keyframe(id).ok_or(OptimizerError::UnknownKeyFrame(id))?;
        builder.stage_keyframe(kf, &to_candidate_local.compose(&kf.pose), false, &policy)?;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmarks and reprojections
    // ─────────────────────────────────────────────────────────────────────────
    let loss: Arc<dyn Loss> = Arc::new(CauchyLoss::new(1.0)?);
    let mut point_blocks: Vec<ParameterBlockId> = Vec::with_capacity(landmarks.len());
    let mut num_reprojections = 0;
    for (lm_idx, lm) in landmarks.iter().enumerate() {
        let point = builder
            .problem_mut()
            .add_parameter_block(lm.position.as_slice(), Manifold::Euclidean);
        point_blocks.push(point);

        for &(kf_id, feature_idx) in &lm.observations {
            if !builder.is_staged(kf_id) {
                return Err(OptimizerError::MissingParameterBlock(format!(
                    "pose of {kf_id}, observer of window landmark {lm_idx}"
                )));
            }
            let keypoint = map
                .get_keyframe(kf_id)
                .and_then(|kf| kf.additional_keypoints.get(feature_idx))
                .copied()
                .ok_or_else(|| {
                    OptimizerError::InvalidWindow(format!("{kf_id} has no additional keypoint {feature_idx}"))
                })?;
            builder.add_reprojection(kf_id, point, &keypoint, Some(Arc::clone(&loss)))?;
            num_reprojections += 1;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Window edges
    // ─────────────────────────────────────────────────────────────────────────
    let mut num_edges = 0;
    for window in [query, candidate] {
        let anchor = window[0];
        let anchor_pose = map_pose(map, anchor)?;
        for &id in &window[1..] {
            let measurement = anchor_pose.between(&map_pose(map, id)?);
            builder.add_between(anchor, id, ba_between_factor(measurement), Some(Arc::clone(&loss)))?;
            num_edges += 1;
        }
    }
    debug!("Window BA problem: {} reprojections, {} window edges", num_reprojections, num_edges);

    let options = config.solver_options(config.lba_iteration_limit);
    let summary = solver.solve(builder.problem_mut(), &options);
    info!(
        "Window BA complete: {} iterations, error {:.4} -> {:.4}",
        summary.iterations, summary.initial_cost, summary.final_cost
    );

    // ─────────────────────────────────────────────────────────────────────────
    // Covariance of the candidate anchor
    // ─────────────────────────────────────────────────────────────────────────
    let mut blocks: Vec<ParameterBlockId> = Vec::new();
    for &id in candidate.iter().chain(&query[1..]) {
        blocks.push(builder.pose_block(id)?);
    }
    blocks.extend(&point_blocks);

    let layout = builder.problem().layout_for(&blocks)?;
    let jacobian = builder.problem().linearize(&layout, LossMode::Corrected).jacobian;
    let information = jacobian.transpose() * &jacobian;
    let full_covariance = information
        .pseudo_inverse(PSEUDO_INVERSE_EPS)
        .map_err(|err| OptimizerError::Numerical(format!("window covariance: {err}")))?;
    let covariance: Matrix6<f64> = full_covariance.fixed_view::<6, 6>(0, 0).into_owned();

    record_or_warn(diagnostics, "lba_jacobian", &jacobian);
    record_or_warn(diagnostics, "lba_covariance", &DMatrix::from_column_slice(6, 6, covariance.as_slice()));

    let t_s1s2 = builder
        .pose(c0)
        .ok_or_else(|| OptimizerError::MissingParameterBlock(format!("pose of {c0}")))?;
    let landmark_positions = point_blocks
        .iter()
        .map(|block| Vector3::from_column_slice(builder.problem().parameter_values(*block)))
        .collect();

    Ok(LocalBAResult { t_s1s2, covariance, landmark_positions, summary })
}

fn map_pose(map: &Map, id: KeyFrameId) -> OptimizerResult<SE3> {
    map.get_keyframe(id)
        .map(|kf| kf.pose)
        .ok_or(OptimizerError::UnknownKeyFrame(id))
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::atlas::map::Keypoint;
    use crate::optimizer::diagnostics::MemoryDiagnosticsSink;
    use crate::optimizer::solver::{solver_for, SolverStrategy};
    use crate::optimizer::test_scenes::{camera, jitter, point_cloud, project, trajectory};

    struct MergeScene {
        map: Map,
        landmarks: Vec<LocalLandmark>,
        query: Vec<KeyFrameId>,
        candidate: Vec<KeyFrameId>,
        true_t_s1s2: SE3,
    }

    /// Agent 0 and agent 1 fly next to each other; agent 1's map lives in a
    /// frame offset by `world_offset`.
    fn merge_scene() -> MergeScene {
        let world_offset = SE3::from_scaled_axis(Vector3::new(0.0, 0.3, 0.05), Vector3::new(2.0, -1.0, 0.5));
        let query_poses = trajectory(3, Vector3::zeros());
        let candidate_poses = trajectory(3, Vector3::new(0.1, 0.3, -0.2));
        let points = point_cloud(15);

        let mut map = Map::new(0);
        let mut add_window = |agent: u32, poses: &[SE3], frame: &SE3| -> Vec<KeyFrameId> {
            poses
                .iter()
                .enumerate()
                .map(|(i, pose)| {
                    let id = map.create_keyframe(agent, i as u64, frame.compose(pose), SE3::identity(), camera(), vec![]);
                    let kf = map.get_keyframe_mut(id).unwrap();
                    kf.additional_keypoints = points
                        .iter()
                        .map(|p| {
                            let uv = project(pose, &SE3::identity(), p);
                            Keypoint::new(uv.x, uv.y, 0)
                        })
                        .collect();
                    id
                })
                .collect()
        };
        let query = add_window(0, &query_poses, &SE3::identity());
        let candidate = add_window(1, &candidate_poses, &world_offset);

        let to_local = query_poses[0].inverse();
        let landmarks = points
            .iter()
            .enumerate()
            .map(|(j, p)| LocalLandmark {
                position: to_local.transform_point(p),
                observations: query.iter().chain(&candidate).map(|id| (*id, j)).collect(),
            })
            .collect();

        MergeScene {
            map,
            landmarks,
            query,
            candidate,
            true_t_s1s2: query_poses[0].between(&candidate_poses[0]),
        }
    }

    #[test]
    fn test_recovers_relative_transform() {
        let scene = merge_scene();
        let mut rng = StdRng::seed_from_u64(21);
        let initial = scene
            .true_t_s1s2
            .compose(&SE3::from_scaled_axis(jitter(&mut rng, 0.01), jitter(&mut rng, 0.05)));

        let config = OptimizerConfig { lba_iteration_limit: 100, ..OptimizerConfig::default() };
        let solver = solver_for(SolverStrategy::Dogleg);
        let sink = MemoryDiagnosticsSink::new();
        let result = local_bundle_adjustment(
            &scene.map,
            &scene.landmarks,
            &scene.query,
            &scene.candidate,
            &initial,
            &config,
            solver.as_ref(),
            Some(&sink),
        )
        .unwrap();

        assert_relative_eq!(result.t_s1s2.translation, scene.true_t_s1s2.translation, epsilon = 1e-3);
        assert!(result.t_s1s2.rotation.angle_to(&scene.true_t_s1s2.rotation) < 1e-3);
        assert!(result.summary.final_cost < result.summary.initial_cost);
        assert_eq!(result.landmark_positions.len(), scene.landmarks.len());

        assert_relative_eq!(result.covariance, result.covariance.transpose(), epsilon = 1e-9);
        for k in 0..6 {
            assert!(result.covariance[(k, k)] >= 0.0);
        }
        let jacobian = sink.get("lba_jacobian").unwrap();
        assert_eq!(jacobian.ncols(), 6 * 3 + 6 * 2 + 3 * scene.landmarks.len());
        assert_eq!(sink.get("lba_covariance").unwrap().shape(), (6, 6));
    }

    #[test]
    fn test_observer_outside_windows_is_fatal() {
        let mut scene = merge_scene();
        scene.landmarks[0].observations.push((KeyFrameId::new(5, 0), 0));
        let config = OptimizerConfig::default();
        let solver = solver_for(SolverStrategy::Dogleg);
        let err = local_bundle_adjustment(
            &scene.map,
            &scene.landmarks,
            &scene.query,
            &scene.candidate,
            &scene.true_t_s1s2,
            &config,
            solver.as_ref(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, OptimizerError::MissingParameterBlock(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_empty_window_is_rejected() {
        let scene = merge_scene();
        let config = OptimizerConfig::default();
        let solver = solver_for(SolverStrategy::Dogleg);
        let err = local_bundle_adjustment(
            &scene.map,
            &scene.landmarks,
            &scene.query,
            &[],
            &scene.true_t_s1s2,
            &config,
            solver.as_ref(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, OptimizerError::InvalidWindow(_)));
        assert!(!err.is_fatal());
    }
}
