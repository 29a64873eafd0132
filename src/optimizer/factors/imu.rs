//! Preintegrated inertial factor between consecutive keyframes.
//!
//! Blocks are `[T_i, v_i, b_i, T_j, v_j, b_j]`, biases stored as
//! `[ba, bg]`. The 15-dim residual
//!
//! ```text
//! r_θ  = Log(ΔR̃ᵀ · R_iᵀ · R_j)
//! r_v  = R_iᵀ (v_j − v_i − g·Δt) − Δṽ
//! r_p  = R_iᵀ (p_j − p_i − v_i·Δt − ½·g·Δt²) − Δp̃
//! r_ba = ba_j − ba_i
//! r_bg = bg_j − bg_i
//! ```
//!
//! uses deltas corrected to first order for `b_i`, and is whitened with the
//! square root of the inverse preintegration covariance.

use nalgebra::{Cholesky, DVector, SVector, Vector3};

use crate::error::{OptimizerError, OptimizerResult};
use crate::imu::{ImuBias, ImuPreintegration, Matrix15, GRAVITY};
use crate::optimizer::manifold::pose_from_params;
use crate::optimizer::problem::CostFunction;

pub const BIAS_SIZE: usize = 6;

#[derive(Debug, Clone)]
pub struct ImuFactor {
    preintegration: ImuPreintegration,
    sqrt_information: Matrix15,
}

impl ImuFactor {
    /// Fails when the preintegration covariance cannot be inverted, which
    /// happens when it holds no measurements.
    pub fn new(preintegration: ImuPreintegration) -> OptimizerResult<Self> {
        let covariance = preintegration.covariance();
        let information = covariance
            .try_inverse()
            .ok_or_else(|| OptimizerError::Numerical("singular preintegration covariance".to_string()))?;
        let information = 0.5 * (information + information.transpose());
        let chol = Cholesky::new(information)
            .ok_or_else(|| OptimizerError::Numerical("preintegration information not positive definite".to_string()))?;
        Ok(Self {
            preintegration,
            sqrt_information: chol.l().transpose(),
        })
    }

    /// Unwhitened residual.
    pub fn raw_residual(&self, params: &[&[f64]]) -> SVector<f64, 15> {
        let pose_i = pose_from_params(params[0]);
        let vel_i = Vector3::from_column_slice(params[1]);
        let bias_i = bias_from_params(params[2]);
        let pose_j = pose_from_params(params[3]);
        let vel_j = Vector3::from_column_slice(params[4]);
        let bias_j = bias_from_params(params[5]);

        let delta = self.preintegration.corrected_state(&bias_i);
        let dt = delta.dt;
        let r_i_inv = pose_i.rotation.inverse();

        let rotation = (delta.delta_rot.inverse() * r_i_inv * pose_j.rotation).scaled_axis();
        let velocity = r_i_inv * (vel_j - vel_i - GRAVITY * dt) - delta.delta_vel;
        let position = r_i_inv
            * (pose_j.translation - pose_i.translation - vel_i * dt - 0.5 * GRAVITY * dt * dt)
            - delta.delta_pos;
        let accel_bias = bias_j.accel - bias_i.accel;
        let gyro_bias = bias_j.gyro - bias_i.gyro;

        let mut r = SVector::<f64, 15>::zeros();
        r.fixed_rows_mut::<3>(0).copy_from(&rotation);
        r.fixed_rows_mut::<3>(3).copy_from(&velocity);
        r.fixed_rows_mut::<3>(6).copy_from(&position);
        r.fixed_rows_mut::<3>(9).copy_from(&accel_bias);
        r.fixed_rows_mut::<3>(12).copy_from(&gyro_bias);
        r
    }
}

impl CostFunction for ImuFactor {
    fn num_residuals(&self) -> usize {
        15
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let whitened = self.sqrt_information * self.raw_residual(params);
        DVector::from_column_slice(whitened.as_slice())
    }
}

pub fn bias_to_params(bias: &ImuBias) -> [f64; BIAS_SIZE] {
    [bias.accel.x, bias.accel.y, bias.accel.z, bias.gyro.x, bias.gyro.y, bias.gyro.z]
}

pub fn bias_from_params(params: &[f64]) -> ImuBias {
    ImuBias::new(
        Vector3::new(params[0], params[1], params[2]),
        Vector3::new(params[3], params[4], params[5]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::imu::{ImuMeasurement, ImuNoise};
    use crate::optimizer::manifold::pose_to_params;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn preintegration(accel: Vector3<f64>, gyro: Vector3<f64>) -> ImuPreintegration {
        let mut preint = ImuPreintegration::new(ImuBias::zero(), ImuNoise::default());
        for _ in 0..100 {
            preint.push(ImuMeasurement { dt: 0.005, accel, gyro });
        }
        preint
    }

    #[test]
    fn test_zero_residual_on_predicted_state() {
        let preint = preintegration(Vector3::new(0.2, 0.1, 9.9), Vector3::new(0.05, -0.1, 0.2));
        let rot_i = UnitQuaternion::from_scaled_axis(Vector3::new(0.1, 0.0, 0.4));
        let pos_i = Vector3::new(1.0, -1.0, 0.5);
        let vel_i = Vector3::new(0.5, 0.2, 0.0);
        let (rot_j, pos_j, vel_j) = preint.predict(&rot_i, &pos_i, &vel_i);

        let factor = ImuFactor::new(preint).unwrap();
        let pose_i = pose_to_params(&SE3::new(rot_i, pos_i));
        let pose_j = pose_to_params(&SE3::new(rot_j, pos_j));
        let bias = bias_to_params(&ImuBias::zero());
        let params: [&[f64]; 6] = [&pose_i, vel_i.as_slice(), &bias, &pose_j, vel_j.as_slice(), &bias];

        assert_relative_eq!(factor.raw_residual(&params).norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_velocity_error_is_whitened() {
        let preint = preintegration(-GRAVITY, Vector3::zeros());
        let factor = ImuFactor::new(preint).unwrap();
        let pose = pose_to_params(&SE3::identity());
        let bias = bias_to_params(&ImuBias::zero());
        let still = [0.0; 3];
        let moving = [0.01, 0.0, 0.0];
        let params: [&[f64]; 6] = [&pose, &still, &bias, &pose, &moving, &bias];

        let raw = factor.raw_residual(&params);
        assert_relative_eq!(raw[3], 0.01, epsilon = 1e-9);
        assert!(factor.evaluate(&params).norm() > raw.norm());
    }

    #[test]
    fn test_empty_preintegration_is_rejected() {
        let preint = ImuPreintegration::new(ImuBias::zero(), ImuNoise::default());
        assert!(ImuFactor::new(preint).is_err());
    }

    #[test]
    fn test_bias_params_round_trip() {
        let bias = ImuBias::new(Vector3::new(0.1, 0.2, 0.3), Vector3::new(-0.1, -0.2, -0.3));
        assert_eq!(bias_from_params(&bias_to_params(&bias)), bias);
    }
}
