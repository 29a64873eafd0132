//! Two-view registration refinement.
//!
//! Refines the transform `T_12` (camera 2 → camera 1) between two keyframes
//! of different maps from landmark correspondences. Each landmark stays fixed
//! in the camera frame of its own keyframe, and only `T_12` is free. Every
//! correspondence contributes two residuals: the kf2 point seen by camera 1
//! and the kf1 point seen by camera 2.

use std::sync::Arc;

use nalgebra::{Vector2, Vector3};
use tracing::{debug, info};

use super::factors::{RelativeDirection, RelativeReprojectionFactor};
use super::loss::{CauchyLoss, Loss};
use super::manifold::{pose_from_params, pose_to_params, Manifold};
use super::problem::{ParameterBlockId, Problem, ResidualBlockId};
use super::solver::Solver;
use crate::atlas::map::{KeyFrame, KeyFrameId, LandmarkId, Map};
use crate::camera::{KernelVisitor, Projector};
use crate::config::OptimizerConfig;
use crate::error::{OptimizerError, OptimizerResult};
use crate::geometry::SE3;

struct Correspondence {
    slot: usize,
    residuals: [ResidualBlockId; 2],
}

struct AddRelativeReprojection<'a> {
    problem: &'a mut Problem,
    point: Vector3<f64>,
    observed: Vector2<f64>,
    sigma: f64,
    direction: RelativeDirection,
    loss: Arc<dyn Loss>,
    pose: ParameterBlockId,
}

impl KernelVisitor for AddRelativeReprojection<'_> {
    type Output = OptimizerResult<ResidualBlockId>;

    fn visit<K: Projector>(self, camera: K) -> Self::Output {
        let factor = RelativeReprojectionFactor::new(camera, self.point, self.observed, self.sigma, self.direction);
        self.problem.add_residual_block(factor, Some(self.loss), &[self.pose])
    }
}

/// Refines `t_12` in place and returns the number of inlier correspondences.
///
/// `matches[i]` names the kf2-side landmark matched to feature `i` of `kf1`.
/// Correspondences whose residual exceeds `threshold` are dropped and their
/// slot cleared. With fewer than `min_relative_pose_inliers` survivors the
/// refinement is rejected: 0 is returned and `t_12` is left untouched.
#[allow(clippy::too_many_arguments)]
pub fn optimize_relative_pose(
    map: &Map,
    kf1: KeyFrameId,
    kf2: KeyFrameId,
    matches: &mut [Option<LandmarkId>],
    t_12: &mut SE3,
    threshold: f64,
    config: &OptimizerConfig,
    solver: &dyn Solver,
) -> OptimizerResult<usize> {
    let kf1 = map.get_keyframe(kf1).ok_or(OptimizerError::UnknownKeyFrame(kf1))?;
    let kf2 = map.get_keyframe(kf2).ok_or(OptimizerError::UnknownKeyFrame(kf2))?;
    let kernel1 = kf1.camera.resolve()?;
    let kernel2 = kf2.camera.resolve()?;
    let t_c1w = kf1.camera_pose().inverse();
    let t_c2w = kf2.camera_pose().inverse();

    let mut problem = Problem::new();
    let pose = problem.add_parameter_block(&pose_to_params(t_12), Manifold::Pose);
    let loss: Arc<dyn Loss> = Arc::new(CauchyLoss::new(1.0)?);

    let mut correspondences = Vec::new();
    for (slot, matched) in matches.iter().enumerate() {
        let Some((kp2_idx, p_a, p_b)) = matched.and_then(|lm_b| correspondence(map, kf1, kf2, slot, lm_b)) else {
            continue;
        };
        let (kp1, kp2) = (&kf1.keypoints[slot], &kf2.keypoints[kp2_idx]);

        let seen_from_1 = AddRelativeReprojection {
            problem: &mut problem,
            point: t_c2w.transform_point(&p_b),
            observed: kp1.uv,
            sigma: kp1.sigma(),
            direction: RelativeDirection::Forward,
            loss: Arc::clone(&loss),
            pose,
        };
        let r1 = kernel1.dispatch(seen_from_1)?;
        let seen_from_2 = AddRelativeReprojection {
            problem: &mut problem,
            point: t_c1w.transform_point(&p_a),
            observed: kp2.uv,
            sigma: kp2.sigma(),
            direction: RelativeDirection::Inverse,
            loss: Arc::clone(&loss),
            pose,
        };
        let r2 = kernel2.dispatch(seen_from_2)?;
        let residuals = [r1, r2];
        correspondences.push(Correspondence { slot, residuals });
    }

    let options = config.solver_options(config.outlier_pass_iterations);
    let summary = solver.solve(&mut problem, &options);
    debug!(
        "Two-view pass 1: {} correspondences, error {:.4} -> {:.4}",
        correspondences.len(),
        summary.initial_cost,
        summary.final_cost
    );

    let mut inliers = 0;
    for c in &correspondences {
        let is_outlier = c.residuals.iter().any(|id| {
            problem
                .evaluate_residual(*id)
                .map_or(true, |r| r.norm() > threshold)
        });
        if is_outlier {
            for id in c.residuals {
                problem.remove_residual_block(id);
            }
            matches[c.slot] = None;
        } else {
            inliers += 1;
        }
    }

    if inliers < config.min_relative_pose_inliers {
        info!(
            "Two-view refinement rejected: {} of {} correspondences survived",
            inliers,
            correspondences.len()
        );
        return Ok(0);
    }

    let summary = solver.solve(&mut problem, &options);
    *t_12 = pose_from_params(problem.parameter_values(pose));
    info!(
        "Two-view refinement: {} inliers, error {:.4} -> {:.4}",
        inliers, summary.initial_cost, summary.final_cost
    );
    Ok(inliers)
}

/// Index of the matched landmark in kf2 and both world positions, if the
/// match is usable.
fn correspondence(
    map: &Map,
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    slot: usize,
    lm_b: LandmarkId,
) -> Option<(usize, Vector3<f64>, Vector3<f64>)> {
    let lm_a = map.get_landmark(kf1.landmark(slot)?)?;
    let lm_b = map.get_landmark(lm_b)?;
    if lm_a.is_invalid || lm_b.is_invalid {
        return None;
    }
    let kp2_idx = lm_b.observation(kf2.id)?;
    if kp2_idx >= kf2.keypoints.len() {
        return None;
    }
    Some((kp2_idx, lm_a.position, lm_b.position))
}
