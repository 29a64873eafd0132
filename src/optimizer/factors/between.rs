//! 6-DOF relative pose constraint.

use nalgebra::{DVector, Matrix6, Vector6};

use crate::geometry::SE3;
use crate::optimizer::manifold::pose_from_params;
use crate::optimizer::problem::CostFunction;

/// Constrains `T_i⁻¹ · T_j` to a measured `T_ij` over blocks `[T_i, T_j]`.
///
/// ```text
/// r = S · [ 2 · vec(q_ijᵐ⁻¹ ⊗ q_ij) ]
///         [ t_ij − t_ijᵐ            ]
/// ```
///
/// with `S` the square-root information, rotation rows first.
#[derive(Debug, Clone)]
pub struct BetweenFactor {
    measurement: SE3,
    sqrt_information: Matrix6<f64>,
}

impl BetweenFactor {
    pub fn new(measurement: SE3, sqrt_information: Matrix6<f64>) -> Self {
        Self {
            measurement,
            sqrt_information,
        }
    }

    /// Diagonal weighting: `diag(w_rot·I₃, w_trans·I₃)`.
    pub fn with_weights(measurement: SE3, rotation_weight: f64, translation_weight: f64) -> Self {
        let diag = Vector6::new(
            rotation_weight,
            rotation_weight,
            rotation_weight,
            translation_weight,
            translation_weight,
            translation_weight,
        );
        Self::new(measurement, Matrix6::from_diagonal(&diag))
    }
}

impl CostFunction for BetweenFactor {
    fn num_residuals(&self) -> usize {
        6
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let t_i = pose_from_params(params[0]);
        let t_j = pose_from_params(params[1]);
        let t_ij = t_i.between(&t_j);

        let dq = self.measurement.rotation.inverse() * t_ij.rotation;
        // Keep the error on the short side of the double cover.
        let sign = if dq.w < 0.0 { -1.0 } else { 1.0 };
        let rot = dq.imag() * (2.0 * sign);
        let trans = t_ij.translation - self.measurement.translation;

        let error = Vector6::new(rot.x, rot.y, rot.z, trans.x, trans.y, trans.z);
        let weighted = self.sqrt_information * error;
        DVector::from_column_slice(weighted.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::manifold::pose_to_params;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_zero_at_measurement() {
        let t_i = SE3::from_scaled_axis(Vector3::new(0.1, 0.2, 0.3), Vector3::new(1.0, 0.0, 0.0));
        let t_j = SE3::from_scaled_axis(Vector3::new(-0.2, 0.0, 0.5), Vector3::new(2.0, 1.0, 0.5));
        let factor = BetweenFactor::with_weights(t_i.between(&t_j), 1.0, 1.0);
        let r = factor.evaluate(&[&pose_to_params(&t_i), &pose_to_params(&t_j)]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_weights_scale_rows() {
        let factor = BetweenFactor::with_weights(SE3::identity(), 100.0, 1e4);
        let t_j = SE3::from_scaled_axis(Vector3::new(0.0, 0.0, 0.01), Vector3::new(0.001, 0.0, 0.0));
        let r = factor.evaluate(&[&pose_to_params(&SE3::identity()), &pose_to_params(&t_j)]);
        assert_relative_eq!(r[2], 100.0 * 0.01, epsilon = 1e-4);
        assert_relative_eq!(r[3], 1e4 * 0.001, epsilon = 1e-9);
    }

    fn negated(params: [f64; 7]) -> [f64; 7] {
        let mut flipped = params;
        for v in &mut flipped[..4] {
            *v = -*v;
        }
        flipped
    }

    #[test]
    fn test_opposite_sign_quaternions_give_same_residual() {
        let t_i = SE3::from_scaled_axis(Vector3::new(0.3, -0.1, 0.2), Vector3::new(1.0, 2.0, 0.0));
        let t_j = SE3::from_scaled_axis(Vector3::new(-0.4, 0.6, 1.1), Vector3::new(0.5, -1.0, 2.0));
        let p_i = pose_to_params(&t_i);

        let exact = BetweenFactor::with_weights(t_i.between(&t_j), 1.0, 1.0);
        let r = exact.evaluate(&[&p_i, &negated(pose_to_params(&t_j))]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);

        // Measurement stored with the other sign.
        let m = t_i.between(&t_j);
        let flipped_m = SE3::new(UnitQuaternion::new_unchecked(-m.rotation.into_inner()), m.translation);
        let r = BetweenFactor::with_weights(flipped_m, 1.0, 1.0).evaluate(&[&p_i, &pose_to_params(&t_j)]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-12);

        // Off the measurement, the sign of the stored pose does not change the error.
        let offset = BetweenFactor::with_weights(
            m.compose(&SE3::from_scaled_axis(Vector3::new(0.02, -0.01, 0.03), Vector3::zeros())),
            1.0,
            1.0,
        );
        let r_pos = offset.evaluate(&[&p_i, &pose_to_params(&t_j)]);
        let r_neg = offset.evaluate(&[&p_i, &negated(pose_to_params(&t_j))]);
        assert!(r_pos.norm() > 0.01);
        assert_relative_eq!(r_pos, r_neg, epsilon = 1e-12);
    }
}
