use nalgebra::Matrix6;

use crate::geometry::SE3;

use super::types::KeyFrameId;

/// An accepted loop closure between two keyframes.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConstraint {
    pub kf1: KeyFrameId,
    pub kf2: KeyFrameId,
    /// Relative transform `T_s1_s2` (sensor 2 in sensor 1).
    pub t_s1_s2: SE3,
    /// Yaw of sensor 2 relative to sensor 1, radians.
    pub relative_yaw: f64,
    /// Covariance of the relative transform; rotation block first, translation
    /// block last.
    pub covariance: Matrix6<f64>,
}

impl LoopConstraint {
    pub fn new(
        kf1: KeyFrameId,
        kf2: KeyFrameId,
        t_s1_s2: SE3,
        relative_yaw: f64,
        covariance: Matrix6<f64>,
    ) -> Self {
        Self { kf1, kf2, t_s1_s2, relative_yaw, covariance }
    }

    /// Trace of the translation covariance block, the input of loop weighting.
    pub fn translation_covariance_trace(&self) -> f64 {
        self.covariance.fixed_view::<3, 3>(3, 3).trace()
    }
}
