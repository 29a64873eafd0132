//! Yaw + translation relative pose constraints.
//!
//! Blocks are `[yaw_i, t_i, yaw_j, t_j]`. Pitch and roll of keyframe `i` are
//! baked into the factor when the edge is built.

use nalgebra::{DVector, Vector3};

use crate::geometry::{normalize_angle, ypr_to_matrix};
use crate::optimizer::problem::CostFunction;

/// ```text
/// r_t   = R(yaw_i, pitch_i, roll_i)ᵀ (t_j − t_i) − t_ij
/// r_yaw = wrap(yaw_j − yaw_i − Δyaw)
/// ```
#[derive(Debug, Clone)]
pub struct FourDofFactor {
    relative_translation: Vector3<f64>,
    relative_yaw: f64,
    pitch_i: f64,
    roll_i: f64,
    translation_weight: f64,
    yaw_weight: f64,
}

impl FourDofFactor {
    pub fn new(relative_translation: Vector3<f64>, relative_yaw: f64, pitch_i: f64, roll_i: f64) -> Self {
        Self {
            relative_translation,
            relative_yaw,
            pitch_i,
            roll_i,
            translation_weight: 1.0,
            yaw_weight: 1.0,
        }
    }

    /// Translation rows scaled by `weight`, the yaw row by `weight / 10`.
    pub fn weighted(
        relative_translation: Vector3<f64>,
        relative_yaw: f64,
        pitch_i: f64,
        roll_i: f64,
        weight: f64,
    ) -> Self {
        Self {
            translation_weight: weight,
            yaw_weight: weight / 10.0,
            ..Self::new(relative_translation, relative_yaw, pitch_i, roll_i)
        }
    }
}

impl CostFunction for FourDofFactor {
    fn num_residuals(&self) -> usize {
        4
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let yaw_i = params[0][0];
        let t_i = Vector3::new(params[1][0], params[1][1], params[1][2]);
        let yaw_j = params[2][0];
        let t_j = Vector3::new(params[3][0], params[3][1], params[3][2]);

        let r_wi = ypr_to_matrix(yaw_i, self.pitch_i, self.roll_i);
        let t_ij = r_wi.transpose() * (t_j - t_i);
        let e_t = (t_ij - self.relative_translation) * self.translation_weight;
        let e_yaw = normalize_angle(yaw_j - yaw_i - self.relative_yaw) * self.yaw_weight;

        DVector::from_vec(vec![e_t.x, e_t.y, e_t.z, e_yaw])
    }
}
