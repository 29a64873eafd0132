//! Staging of map state into a solver [`Problem`].
//!
//! Every optimizer follows the same three phases: stage entities into the
//! parameter arena, solve, and read the solved values back. This module owns
//! the first phase. It resolves each keyframe's camera once, records which
//! parameter block belongs to which entity, and wires the residuals shared by
//! the optimizers. Nothing here mutates the map except IMU repropagation.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::{Vector2, Vector3};
use tracing::{debug, warn};

use super::factors::{bias_from_params, bias_to_params, BetweenFactor, ImuFactor, ReprojectionFactor};
use super::loss::Loss;
use super::manifold::{pose_from_params, pose_to_params, Manifold};
use super::problem::{ParameterBlockId, Problem, ResidualBlockId};
use crate::atlas::map::{KeyFrame, KeyFrameId, Keypoint, LandmarkId, Map};
use crate::camera::{CameraKernel, KernelVisitor, Projector};
use crate::error::{OptimizerError, OptimizerResult};
use crate::geometry::SE3;
use crate::imu::ImuBias;

/// Minimum observations from staged keyframes for a landmark to join BA.
pub const MIN_LANDMARK_OBSERVATIONS: usize = 2;

/// Square-root information of loop and window edges in bundle adjustment.
pub const BA_EDGE_ROTATION_WEIGHT: f64 = 100.0;
pub const BA_EDGE_TRANSLATION_WEIGHT: f64 = 1e4;

/// Which blocks to stage and which to hold constant.
#[derive(Debug, Clone, Copy, Default)]
pub struct StagingPolicy {
    /// Stage velocity and bias blocks.
    pub inertial: bool,
    /// Leave the bias blocks free. Ignored unless `inertial`.
    pub estimate_bias: bool,
    /// Hold keyframes loaded from a previous session constant.
    pub fix_loaded: bool,
    /// Hold keyframes already refined by GBA constant.
    pub fix_gba_optimized: bool,
}

/// Solver-side handles of one keyframe.
#[derive(Debug, Clone, Copy)]
pub struct StagedKeyFrame {
    pub pose: ParameterBlockId,
    pub velocity: Option<ParameterBlockId>,
    pub bias: Option<ParameterBlockId>,
    pub kernel: CameraKernel,
    /// Camera-to-sensor transform (T_sc).
    pub extrinsics: SE3,
}

/// A reprojection residual and the observation it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReprojectionEdge {
    pub residual: ResidualBlockId,
    pub keyframe: KeyFrameId,
    pub feature_idx: usize,
    pub landmark: LandmarkId,
}

/// Outcome of [`ProblemBuilder::stage_map_landmarks`].
#[derive(Debug, Clone, Default)]
pub struct LandmarkStaging {
    pub edges: Vec<ReprojectionEdge>,
    pub included: usize,
    pub excluded: usize,
}

#[derive(Default)]
pub struct ProblemBuilder {
    problem: Problem,
    keyframes: BTreeMap<KeyFrameId, StagedKeyFrame>,
    landmarks: BTreeMap<LandmarkId, ParameterBlockId>,
}

impl ProblemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn problem(&self) -> &Problem {
        &self.problem
    }

    pub fn problem_mut(&mut self) -> &mut Problem {
        &mut self.problem
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keyframes
    // ─────────────────────────────────────────────────────────────────────────

    /// Stages `kf` with the given initial pose. The camera is resolved here,
    /// so an unsupported camera fails before any residual exists.
    pub fn stage_keyframe(
        &mut self,
        kf: &KeyFrame,
        pose: &SE3,
        constant: bool,
        policy: &StagingPolicy,
    ) -> OptimizerResult<ParameterBlockId> {
        let kernel = kf.camera.resolve()?;

        let pose_block = self.problem.add_parameter_block(&pose_to_params(pose), Manifold::Pose);
        if constant {
            self.problem.set_constant(pose_block);
        }

        let (velocity, bias) = if policy.inertial {
            let velocity = self.problem.add_parameter_block(kf.velocity.as_slice(), Manifold::Euclidean);
            let bias = self
                .problem
                .add_parameter_block(&bias_to_params(&kf.imu_bias), Manifold::Euclidean);
            if !policy.estimate_bias {
                self.problem.set_constant(bias);
            }
            (Some(velocity), Some(bias))
        } else {
            (None, None)
        };

        self.keyframes.insert(
            kf.id,
            StagedKeyFrame {
                pose: pose_block,
                velocity,
                bias,
                kernel,
                extrinsics: kf.extrinsics,
            },
        );
        Ok(pose_block)
    }

    /// Stages every valid keyframe of `map` at its current pose. The anchor is
    /// always constant; loaded and GBA-optimized keyframes follow `policy`.
    pub fn stage_map_keyframes(&mut self, map: &Map, policy: &StagingPolicy) -> OptimizerResult<usize> {
        let anchor = map.anchor_id();
        let mut staged = 0;
        for kf in map.keyframes().filter(|kf| !kf.is_invalid) {
            let constant = kf.id == anchor
                || (policy.fix_loaded && kf.is_loaded)
                || (policy.fix_gba_optimized && kf.is_gba_optimized);
            self.stage_keyframe(kf, &kf.pose, constant, policy)?;
            staged += 1;
        }
        Ok(staged)
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&StagedKeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn is_staged(&self, id: KeyFrameId) -> bool {
        self.keyframes.contains_key(&id)
    }

    pub fn staged_keyframes(&self) -> impl Iterator<Item = (&KeyFrameId, &StagedKeyFrame)> {
        self.keyframes.iter()
    }

    fn staged(&self, id: KeyFrameId) -> OptimizerResult<&StagedKeyFrame> {
        self.keyframes
            .get(&id)
            .ok_or_else(|| OptimizerError::MissingParameterBlock(format!("pose of {id}")))
    }

    pub fn pose_block(&self, id: KeyFrameId) -> OptimizerResult<ParameterBlockId> {
        Ok(self.staged(id)?.pose)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmarks and reprojection residuals
    // ─────────────────────────────────────────────────────────────────────────

    pub fn stage_landmark(&mut self, id: LandmarkId, position: &Vector3<f64>) -> ParameterBlockId {
        let block = self.problem.add_parameter_block(position.as_slice(), Manifold::Euclidean);
        self.landmarks.insert(id, block);
        block
    }

    pub fn landmark_block(&self, id: LandmarkId) -> Option<ParameterBlockId> {
        self.landmarks.get(&id).copied()
    }

    pub fn staged_landmarks(&self) -> impl Iterator<Item = (&LandmarkId, &ParameterBlockId)> {
        self.landmarks.iter()
    }

    /// Adds `(π(point seen from kf) − keypoint) / σ` over `[pose(kf), point]`.
    pub fn add_reprojection(
        &mut self,
        kf_id: KeyFrameId,
        point: ParameterBlockId,
        keypoint: &Keypoint,
        loss: Option<Arc<dyn Loss>>,
    ) -> OptimizerResult<ResidualBlockId> {
        let staged = *self.staged(kf_id)?;
        staged.kernel.dispatch(AddReprojection {
            problem: &mut self.problem,
            extrinsics: staged.extrinsics,
            observed: keypoint.uv,
            sigma: keypoint.sigma(),
            loss,
            blocks: [staged.pose, point],
        })
    }

    /// Stages every valid landmark with enough observations from staged
    /// keyframes, with one reprojection residual per such observation.
    pub fn stage_map_landmarks(
        &mut self,
        map: &Map,
        loss: Option<Arc<dyn Loss>>,
    ) -> OptimizerResult<LandmarkStaging> {
        let mut staging = LandmarkStaging::default();

        for lm in map.landmarks().filter(|lm| !lm.is_invalid) {
            let observations: Vec<(KeyFrameId, usize)> = lm
                .observations
                .iter()
                .filter(|(kf_id, _)| self.is_staged(**kf_id))
                .map(|(kf_id, idx)| (*kf_id, *idx))
                .collect();
            if observations.len() < MIN_LANDMARK_OBSERVATIONS {
                staging.excluded += 1;
                continue;
            }

            let point = self.stage_landmark(lm.id, &lm.position);
            staging.included += 1;

            for (kf_id, feature_idx) in observations {
                let Some(keypoint) = map.get_keyframe(kf_id).and_then(|kf| kf.keypoints.get(feature_idx)) else {
                    warn!("{} observes {} at missing feature {}", kf_id, lm.id, feature_idx);
                    continue;
                };
                let residual = self.add_reprojection(kf_id, point, keypoint, loss.clone())?;
                staging.edges.push(ReprojectionEdge {
                    residual,
                    keyframe: kf_id,
                    feature_idx,
                    landmark: lm.id,
                });
            }
        }

        Ok(staging)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inertial and relative-pose residuals
    // ─────────────────────────────────────────────────────────────────────────

    /// Links every staged keyframe to its predecessor with an IMU factor.
    ///
    /// A keyframe other than the first of its agent must have a valid, staged
    /// predecessor and a preintegration; anything else is a broken map.
    /// Preintegrations without measurements are skipped.
    pub fn add_imu_factors(&mut self, map: &mut Map) -> OptimizerResult<usize> {
        let ids: Vec<KeyFrameId> = self.keyframes.keys().copied().collect();
        let mut added = 0;

        for kf_id in ids {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            let predecessor = kf.predecessor.filter(|pred| map.is_valid_keyframe(*pred));
            let Some(pred_id) = predecessor else {
                if kf_id.is_first_of_agent() {
                    continue;
                }
                return Err(OptimizerError::MissingPredecessor { kf: kf_id });
            };
            let num_measurements = match &kf.preintegration {
                Some(preint) => preint.num_measurements(),
                None => return Err(OptimizerError::MissingPredecessor { kf: kf_id }),
            };
            if num_measurements == 0 {
                debug!("{} has no IMU measurements, skipping IMU factor", kf_id);
                continue;
            }

            let pred = *self.staged(pred_id)?;
            let curr = *self.staged(kf_id)?;
            let blocks = match (pred.velocity, pred.bias, curr.velocity, curr.bias) {
                (Some(v_i), Some(b_i), Some(v_j), Some(b_j)) => [pred.pose, v_i, b_i, curr.pose, v_j, b_j],
                _ => {
                    return Err(OptimizerError::MissingParameterBlock(format!(
                        "velocity/bias of {pred_id} or {kf_id}"
                    )))
                }
            };

            let bias = self.bias(kf_id).unwrap_or_else(ImuBias::zero);
            let Some(preint) = map.get_keyframe_mut(kf_id).and_then(|kf| kf.preintegration.as_mut()) else {
                continue;
            };
            preint.repropagate(&bias.accel, &bias.gyro);
            let factor = ImuFactor::new(preint.clone())?;
            self.problem.add_residual_block(factor, None, &blocks)?;
            added += 1;
        }

        Ok(added)
    }

    /// Adds a 6-DOF between edge `T_i⁻¹ T_j ≈ measurement`.
    pub fn add_between(
        &mut self,
        from: KeyFrameId,
        to: KeyFrameId,
        factor: BetweenFactor,
        loss: Option<Arc<dyn Loss>>,
    ) -> OptimizerResult<ResidualBlockId> {
        let blocks = [self.pose_block(from)?, self.pose_block(to)?];
        self.problem.add_residual_block(factor, loss, &blocks)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Read-back
    // ─────────────────────────────────────────────────────────────────────────

    pub fn pose(&self, id: KeyFrameId) -> Option<SE3> {
        let staged = self.keyframes.get(&id)?;
        Some(pose_from_params(self.problem.parameter_values(staged.pose)))
    }

    pub fn velocity(&self, id: KeyFrameId) -> Option<Vector3<f64>> {
        let block = self.keyframes.get(&id)?.velocity?;
        Some(Vector3::from_column_slice(self.problem.parameter_values(block)))
    }

    pub fn bias(&self, id: KeyFrameId) -> Option<ImuBias> {
        let block = self.keyframes.get(&id)?.bias?;
        Some(bias_from_params(self.problem.parameter_values(block)))
    }

    pub fn landmark_position(&self, id: LandmarkId) -> Option<Vector3<f64>> {
        let block = self.landmarks.get(&id)?;
        Some(Vector3::from_column_slice(self.problem.parameter_values(*block)))
    }
}

/// Between edge weighted like the loop and window edges of bundle adjustment.
pub fn ba_between_factor(measurement: SE3) -> BetweenFactor {
    BetweenFactor::with_weights(measurement, BA_EDGE_ROTATION_WEIGHT, BA_EDGE_TRANSLATION_WEIGHT)
}

/// Adds a reprojection residual specialized to the keyframe's camera.
struct AddReprojection<'a> {
    problem: &'a mut Problem,
    extrinsics: SE3,
    observed: Vector2<f64>,
    sigma: f64,
    loss: Option<Arc<dyn Loss>>,
    blocks: [ParameterBlockId; 2],
}

impl KernelVisitor for AddReprojection<'_> {
    type Output = OptimizerResult<ResidualBlockId>;

    fn visit<K: Projector>(self, camera: K) -> Self::Output {
        let factor = ReprojectionFactor::new(camera, &self.extrinsics, self.observed, self.sigma);
        self.problem.add_residual_block(factor, self.loss, &self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraModel, DistortionKind};
    use crate::imu::{ImuMeasurement, ImuNoise, ImuPreintegration};
    use crate::optimizer::loss::CauchyLoss;
    use crate::optimizer::problem::CostFunction;

    fn chain_map(n: usize) -> Map {
        let mut map = Map::new(0);
        for i in 0..n {
            let pose = SE3::from_translation(Vector3::new(i as f64 * 0.2, 0.0, 0.0));
            let keypoints = vec![Keypoint::new(320.0, 240.0, 0), Keypoint::new(300.0, 200.0, 1)];
            map.create_keyframe(
                0,
                i as u64,
                pose,
                SE3::identity(),
                CameraModel::pinhole(400.0, 400.0, 320.0, 240.0),
                keypoints,
            );
        }
        map
    }

    #[test]
    fn test_anchor_and_loaded_keyframes_are_constant() {
        let mut map = chain_map(3);
        map.get_keyframe_mut(KeyFrameId::new(0, 2)).unwrap().is_loaded = true;

        let mut builder = ProblemBuilder::new();
        let policy = StagingPolicy { fix_loaded: true, ..StagingPolicy::default() };
        assert_eq!(builder.stage_map_keyframes(&map, &policy).unwrap(), 3);

        let problem = builder.problem();
        assert!(problem.is_constant(builder.pose_block(KeyFrameId::new(0, 0)).unwrap()));
        assert!(!problem.is_constant(builder.pose_block(KeyFrameId::new(0, 1)).unwrap()));
        assert!(problem.is_constant(builder.pose_block(KeyFrameId::new(0, 2)).unwrap()));
        assert!(builder.keyframe(KeyFrameId::new(0, 1)).unwrap().velocity.is_none());
    }

    #[test]
    fn test_invalid_keyframes_are_not_staged() {
        let mut map = chain_map(3);
        map.get_keyframe_mut(KeyFrameId::new(0, 1)).unwrap().is_invalid = true;
        let mut builder = ProblemBuilder::new();
        builder.stage_map_keyframes(&map, &StagingPolicy::default()).unwrap();
        assert!(!builder.is_staged(KeyFrameId::new(0, 1)));
        let err = builder.pose_block(KeyFrameId::new(0, 1)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_distortion_is_fatal() {
        let mut map = chain_map(2);
        let kf = map.get_keyframe_mut(KeyFrameId::new(0, 1)).unwrap();
        kf.camera = kf.camera.clone().with_distortion(DistortionKind::None, vec![]);
        let mut builder = ProblemBuilder::new();
        let err = builder.stage_map_keyframes(&map, &StagingPolicy::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_reprojection_residual_follows_keyframe_camera() {
        let mut map = chain_map(2);
        let id = KeyFrameId::new(0, 1);
        let kf = map.get_keyframe_mut(id).unwrap();
        kf.camera = kf.camera.clone().with_distortion(DistortionKind::Equidistant, vec![0.02, -0.01, 0.003, 0.0]);
        kf.extrinsics = SE3::from_translation(Vector3::new(0.05, 0.0, 0.0));

        let mut builder = ProblemBuilder::new();
        builder.stage_map_keyframes(&map, &StagingPolicy::default()).unwrap();
        let position = [0.4, -0.3, 5.0];
        let point = builder.problem.add_parameter_block(&position, Manifold::Euclidean);
        let keypoint = Keypoint::new(331.0, 212.0, 1);
        let residual = builder.add_reprojection(id, point, &keypoint, None).unwrap();

        let kf = map.get_keyframe(id).unwrap();
        let kernel = kf.camera.resolve().unwrap();
        let reference = ReprojectionFactor::new(kernel, &kf.extrinsics, keypoint.uv, keypoint.sigma());
        let expected = reference.evaluate(&[&pose_to_params(&kf.pose), &position]);
        let actual = builder.problem().evaluate_residual(residual).unwrap();
        assert!(expected.norm() > 1.0);
        assert!((actual - expected).norm() < 1e-12);
    }

    #[test]
    fn test_landmark_needs_two_staged_observations() {
        let mut map = chain_map(3);
        let seen_twice = map.create_landmark(Vector3::new(0.0, 0.0, 5.0), Some(KeyFrameId::new(0, 0)));
        map.associate(KeyFrameId::new(0, 0), 0, seen_twice);
        map.associate(KeyFrameId::new(0, 1), 0, seen_twice);
        let seen_once = map.create_landmark(Vector3::new(0.0, 0.0, 5.0), Some(KeyFrameId::new(0, 0)));
        map.associate(KeyFrameId::new(0, 0), 1, seen_once);
        map.associate(KeyFrameId::new(0, 2), 1, seen_once);
        map.get_keyframe_mut(KeyFrameId::new(0, 2)).unwrap().is_invalid = true;

        let mut builder = ProblemBuilder::new();
        builder.stage_map_keyframes(&map, &StagingPolicy::default()).unwrap();
        let loss: Arc<dyn Loss> = Arc::new(CauchyLoss::new(1.0).unwrap());
        let staging = builder.stage_map_landmarks(&map, Some(loss)).unwrap();

        assert_eq!(staging.included, 1);
        assert_eq!(staging.excluded, 1);
        assert_eq!(staging.edges.len(), 2);
        assert!(builder.landmark_block(seen_twice).is_some());
        assert!(builder.landmark_block(seen_once).is_none());
    }

    #[test]
    fn test_missing_predecessor_is_fatal() {
        let mut map = chain_map(3);
        map.get_keyframe_mut(KeyFrameId::new(0, 1)).unwrap().is_invalid = true;
        let mut builder = ProblemBuilder::new();
        let policy = StagingPolicy { inertial: true, estimate_bias: true, ..StagingPolicy::default() };
        builder.stage_map_keyframes(&map, &policy).unwrap();
        let err = builder.add_imu_factors(&mut map).unwrap_err();
        assert!(matches!(err, OptimizerError::MissingPredecessor { kf } if kf == KeyFrameId::new(0, 2)));
    }

    #[test]
    fn test_imu_factors_skip_empty_preintegration() {
        let mut map = chain_map(3);
        for seq in 1..3 {
            let mut preint = ImuPreintegration::new(ImuBias::zero(), ImuNoise::default());
            if seq == 2 {
                for _ in 0..20 {
                    preint.push(ImuMeasurement {
                        dt: 0.01,
                        accel: Vector3::new(0.0, 0.0, 9.81),
                        gyro: Vector3::zeros(),
                    });
                }
            }
            map.get_keyframe_mut(KeyFrameId::new(0, seq)).unwrap().preintegration = Some(preint);
        }

        let mut builder = ProblemBuilder::new();
        let policy = StagingPolicy { inertial: true, estimate_bias: false, ..StagingPolicy::default() };
        builder.stage_map_keyframes(&map, &policy).unwrap();
        assert_eq!(builder.add_imu_factors(&mut map).unwrap(), 1);

        let bias = builder.keyframe(KeyFrameId::new(0, 1)).unwrap().bias.unwrap();
        assert!(builder.problem().is_constant(bias));
    }
}
