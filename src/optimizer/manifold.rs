//! Parameter-block manifolds.
//!
//! Blocks are stored in their ambient representation; the solver steps in the
//! tangent space and maps back with [`Manifold::plus`].
//!
//! Pose blocks are `[qx, qy, qz, qw, tx, ty, tz]`; the rotation is perturbed
//! on the right, `q ⊗ Exp(δθ)`, and the translation additively.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::geometry::{normalize_angle, SE3};

pub const POSE_SIZE: usize = 7;
pub const POSE_TANGENT_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifold {
    Euclidean,
    Pose,
    /// Scalar angle wrapped into (-π, π].
    Angle,
}

impl Manifold {
    pub fn tangent_size(&self, ambient_size: usize) -> usize {
        match self {
            Manifold::Euclidean => ambient_size,
            Manifold::Pose => POSE_TANGENT_SIZE,
            Manifold::Angle => 1,
        }
    }

    /// `out = x ⊞ delta`.
    pub fn plus(&self, x: &[f64], delta: &[f64], out: &mut [f64]) {
        match self {
            Manifold::Euclidean => {
                for ((o, xi), di) in out.iter_mut().zip(x).zip(delta) {
                    *o = xi + di;
                }
            }
            Manifold::Angle => {
                out[0] = normalize_angle(x[0] + delta[0]);
            }
            Manifold::Pose => {
                let pose = pose_from_params(x);
                let dq = UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]));
                let rotation = UnitQuaternion::new_normalize((pose.rotation * dq).into_inner());
                let translation = pose.translation + Vector3::new(delta[3], delta[4], delta[5]);
                out.copy_from_slice(&pose_to_params(&SE3::new(rotation, translation)));
            }
        }
    }
}

pub fn pose_to_params(pose: &SE3) -> [f64; POSE_SIZE] {
    let q = pose.rotation.quaternion();
    let t = &pose.translation;
    [q.i, q.j, q.k, q.w, t.x, t.y, t.z]
}

/// Reads a pose block. The stored quaternion is trusted to be unit, so a
/// block read back unchanged reproduces the pose bit for bit.
pub fn pose_from_params(params: &[f64]) -> SE3 {
    let rotation = UnitQuaternion::new_unchecked(Quaternion::new(params[3], params[0], params[1], params[2]));
    SE3::new(rotation, Vector3::new(params[4], params[5], params[6]))
}
