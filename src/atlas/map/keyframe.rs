//! KeyFrame - a selected frame of one agent's trajectory.
//!
//! A keyframe owns its sensor state (pose, velocity, IMU bias), its fixed
//! calibration (extrinsics and camera) and its feature observations. Landmarks
//! are referenced by id; the map keeps both sides of every association in sync.

use nalgebra::{Vector2, Vector3};

use crate::camera::CameraModel;
use crate::geometry::SE3;
use crate::imu::{ImuBias, ImuPreintegration};

use super::types::{KeyFrameId, LandmarkId};

/// A distorted image measurement and the pyramid level it was detected on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub uv: Vector2<f64>,
    pub octave: u32,
}

impl Keypoint {
    pub fn new(u: f64, v: f64, octave: u32) -> Self {
        Self { uv: Vector2::new(u, v), octave }
    }

    /// Measurement standard deviation in pixels: `(octave + 1) * 2`.
    #[inline]
    pub fn sigma(&self) -> f64 {
        (self.octave as f64 + 1.0) * 2.0
    }
}

#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Sensor-to-world transform (T_ws).
    pub pose: SE3,

    /// Velocity of the sensor in world frame (m/s).
    pub velocity: Vector3<f64>,

    pub imu_bias: ImuBias,

    // ─────────────────────────────────────────────────────────────────────────
    // Calibration (never optimized)
    // ─────────────────────────────────────────────────────────────────────────
    /// Camera-to-sensor transform (T_sc).
    pub extrinsics: SE3,

    pub camera: CameraModel,

    // ─────────────────────────────────────────────────────────────────────────
    // Observations
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<Keypoint>,

    /// Feature index → Landmark association.
    landmarks: Vec<Option<LandmarkId>>,

    /// Keypoints matched against a merge candidate. Only window BA reads them.
    pub additional_keypoints: Vec<Keypoint>,

    // ─────────────────────────────────────────────────────────────────────────
    // Temporal chain
    // ─────────────────────────────────────────────────────────────────────────
    pub predecessor: Option<KeyFrameId>,
    pub successor: Option<KeyFrameId>,

    /// IMU preintegrated from the predecessor to this keyframe.
    pub preintegration: Option<ImuPreintegration>,

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────
    pub is_invalid: bool,
    /// Loaded from a previous session.
    pub is_loaded: bool,
    pub pose_optimized: bool,
    pub vel_bias_optimized: bool,
    pub is_gba_optimized: bool,
}

impl KeyFrame {
    pub fn new(
        id: KeyFrameId,
        timestamp_ns: u64,
        pose: SE3,
        extrinsics: SE3,
        camera: CameraModel,
        keypoints: Vec<Keypoint>,
    ) -> Self {
        let num_features = keypoints.len();
        Self {
            id,
            timestamp_ns,
            pose,
            velocity: Vector3::zeros(),
            imu_bias: ImuBias::zero(),
            extrinsics,
            camera,
            keypoints,
            landmarks: vec![None; num_features],
            additional_keypoints: Vec::new(),
            predecessor: None,
            successor: None,
            preintegration: None,
            is_invalid: false,
            is_loaded: false,
            pose_optimized: false,
            vel_bias_optimized: false,
            is_gba_optimized: false,
        }
    }

    /// Camera-to-world transform: `T_ws · T_sc`.
    pub fn camera_pose(&self) -> SE3 {
        self.pose.compose(&self.extrinsics)
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn landmark(&self, feature_idx: usize) -> Option<LandmarkId> {
        self.landmarks.get(feature_idx).copied().flatten()
    }

    /// Binds a feature to a landmark. Out-of-range indices are ignored.
    pub(crate) fn set_landmark(&mut self, feature_idx: usize, landmark: LandmarkId) {
        if let Some(slot) = self.landmarks.get_mut(feature_idx) {
            *slot = Some(landmark);
        }
    }

    /// Clears a feature binding, returning the landmark it held.
    pub(crate) fn erase_landmark(&mut self, feature_idx: usize) -> Option<LandmarkId> {
        self.landmarks.get_mut(feature_idx).and_then(Option::take)
    }

    /// Iterates over (feature index, landmark) for every bound feature.
    pub fn landmark_bindings(&self) -> impl Iterator<Item = (usize, LandmarkId)> + '_ {
        self.landmarks
            .iter()
            .enumerate()
            .filter_map(|(idx, lm)| lm.map(|id| (idx, id)))
    }

    pub fn num_bound_features(&self) -> usize {
        self.landmarks.iter().filter(|lm| lm.is_some()).count()
    }
}
