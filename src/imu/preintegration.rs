//! On-manifold IMU preintegration (Forster et al.).
//!
//! Raw measurements are kept so the deltas can be re-integrated exactly around
//! a new bias linearization point ([`ImuPreintegration::repropagate`]). Between
//! repropagations, small bias changes are absorbed to first order through the
//! bias Jacobians.
//!
//! Noise state order is `[δθ, δv, δp, δba, δbg]`, matching the 15-dim inertial
//! residual.

use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};

use super::sample::{ImuBias, ImuNoise, ImuSample, GRAVITY};
use crate::geometry::{right_jacobian_so3, skew};

pub type Matrix15 = SMatrix<f64, 15, 15>;
type Matrix9 = SMatrix<f64, 9, 9>;
type Matrix9x6 = SMatrix<f64, 9, 6>;

/// One integration step: bias-uncorrected readings held over `dt`.
#[derive(Debug, Clone, Copy)]
pub struct ImuMeasurement {
    pub dt: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

/// Preintegrated motion between two keyframes, expressed in the body frame of
/// the first one. Gravity is not included.
#[derive(Debug, Clone, Copy)]
pub struct PreintegratedState {
    pub delta_rot: UnitQuaternion<f64>,
    pub delta_vel: Vector3<f64>,
    pub delta_pos: Vector3<f64>,
    pub dt: f64,
}

impl PreintegratedState {
    pub fn identity() -> Self {
        Self {
            delta_rot: UnitQuaternion::identity(),
            delta_vel: Vector3::zeros(),
            delta_pos: Vector3::zeros(),
            dt: 0.0,
        }
    }
}

/// First-order sensitivities of the deltas to the bias.
#[derive(Debug, Clone, Copy)]
pub struct BiasJacobians {
    pub rot_gyro: Matrix3<f64>,
    pub vel_accel: Matrix3<f64>,
    pub vel_gyro: Matrix3<f64>,
    pub pos_accel: Matrix3<f64>,
    pub pos_gyro: Matrix3<f64>,
}

impl BiasJacobians {
    fn zeros() -> Self {
        Self {
            rot_gyro: Matrix3::zeros(),
            vel_accel: Matrix3::zeros(),
            vel_gyro: Matrix3::zeros(),
            pos_accel: Matrix3::zeros(),
            pos_gyro: Matrix3::zeros(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImuPreintegration {
    /// Bias the deltas were integrated with.
    bias: ImuBias,
    noise: ImuNoise,
    measurements: Vec<ImuMeasurement>,
    state: PreintegratedState,
    jacobians: BiasJacobians,
    /// Covariance of `[δθ, δv, δp]`.
    covariance: Matrix9,
}

impl ImuPreintegration {
    pub fn new(bias: ImuBias, noise: ImuNoise) -> Self {
        Self {
            bias,
            noise,
            measurements: Vec::new(),
            state: PreintegratedState::identity(),
            jacobians: BiasJacobians::zeros(),
            covariance: Matrix9::zeros(),
        }
    }

    /// Integrates the interval between two consecutive samples using their
    /// midpoint readings.
    pub fn integrate(&mut self, prev: &ImuSample, curr: &ImuSample) {
        let dt = curr.timestamp_s - prev.timestamp_s;
        if dt <= 0.0 {
            return;
        }
        self.push(ImuMeasurement {
            dt,
            accel: 0.5 * (prev.accel + curr.accel),
            gyro: 0.5 * (prev.gyro + curr.gyro),
        });
    }

    pub fn push(&mut self, measurement: ImuMeasurement) {
        self.measurements.push(measurement);
        self.step(&measurement);
    }

    /// Re-integrates every stored measurement around a new bias.
    pub fn repropagate(&mut self, accel_bias: &Vector3<f64>, gyro_bias: &Vector3<f64>) {
        self.bias = ImuBias::new(*accel_bias, *gyro_bias);
        self.state = PreintegratedState::identity();
        self.jacobians = BiasJacobians::zeros();
        self.covariance = Matrix9::zeros();
        let measurements = std::mem::take(&mut self.measurements);
        for m in &measurements {
            self.step(m);
        }
        self.measurements = measurements;
    }

    pub fn num_measurements(&self) -> usize {
        self.measurements.len()
    }

    pub fn bias(&self) -> &ImuBias {
        &self.bias
    }

    pub fn state(&self) -> &PreintegratedState {
        &self.state
    }

    pub fn jacobians(&self) -> &BiasJacobians {
        &self.jacobians
    }

    pub fn dt(&self) -> f64 {
        self.state.dt
    }

    /// Full covariance of the 15-dim inertial residual, bias random walk
    /// included.
    pub fn covariance(&self) -> Matrix15 {
        let mut cov = Matrix15::zeros();
        cov.fixed_view_mut::<9, 9>(0, 0).copy_from(&self.covariance);
        let dt = self.state.dt;
        let accel_walk = self.noise.sigma_accel_walk * self.noise.sigma_accel_walk * dt;
        let gyro_walk = self.noise.sigma_gyro_walk * self.noise.sigma_gyro_walk * dt;
        for k in 0..3 {
            cov[(9 + k, 9 + k)] = accel_walk;
            cov[(12 + k, 12 + k)] = gyro_walk;
        }
        cov
    }

    /// Deltas corrected to first order for a bias that differs from the
    /// linearization point.
    pub fn corrected_state(&self, bias: &ImuBias) -> PreintegratedState {
        let dba = bias.accel - self.bias.accel;
        let dbg = bias.gyro - self.bias.gyro;
        let j = &self.jacobians;
        PreintegratedState {
            delta_rot: self.state.delta_rot * UnitQuaternion::from_scaled_axis(j.rot_gyro * dbg),
            delta_vel: self.state.delta_vel + j.vel_accel * dba + j.vel_gyro * dbg,
            delta_pos: self.state.delta_pos + j.pos_accel * dba + j.pos_gyro * dbg,
            dt: self.state.dt,
        }
    }

    /// Predicts world rotation, position and velocity at the end of the
    /// interval from the state at its start.
    pub fn predict(
        &self,
        rot_i: &UnitQuaternion<f64>,
        pos_i: &Vector3<f64>,
        vel_i: &Vector3<f64>,
    ) -> (UnitQuaternion<f64>, Vector3<f64>, Vector3<f64>) {
        let dt = self.state.dt;
        let rot = rot_i * self.state.delta_rot;
        let vel = vel_i + GRAVITY * dt + rot_i * self.state.delta_vel;
        let pos = pos_i + vel_i * dt + 0.5 * GRAVITY * dt * dt + rot_i * self.state.delta_pos;
        (rot, pos, vel)
    }

    fn step(&mut self, m: &ImuMeasurement) {
        let dt = m.dt;
        let dt2 = dt * dt;
        let accel = m.accel - self.bias.accel;
        let gyro = m.gyro - self.bias.gyro;

        let delta_r = self.state.delta_rot.to_rotation_matrix().into_inner();
        let inc = UnitQuaternion::from_scaled_axis(gyro * dt);
        let inc_t = inc.to_rotation_matrix().into_inner().transpose();
        let jr = right_jacobian_so3(&(gyro * dt));
        let accel_skew = skew(&accel);

        // Covariance
        let mut a = Matrix9::identity();
        a.fixed_view_mut::<3, 3>(0, 0).copy_from(&inc_t);
        a.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-delta_r * accel_skew * dt));
        a.fixed_view_mut::<3, 3>(6, 0).copy_from(&(-0.5 * delta_r * accel_skew * dt2));
        a.fixed_view_mut::<3, 3>(6, 3).copy_from(&(Matrix3::identity() * dt));

        let mut b = Matrix9x6::zeros();
        b.fixed_view_mut::<3, 3>(0, 0).copy_from(&(jr * dt));
        b.fixed_view_mut::<3, 3>(3, 3).copy_from(&(delta_r * dt));
        b.fixed_view_mut::<3, 3>(6, 3).copy_from(&(0.5 * delta_r * dt2));

        let gyro_var = self.noise.sigma_gyro * self.noise.sigma_gyro / dt;
        let accel_var = self.noise.sigma_accel * self.noise.sigma_accel / dt;
        let mut q = SMatrix::<f64, 6, 6>::zeros();
        for k in 0..3 {
            q[(k, k)] = gyro_var;
            q[(3 + k, 3 + k)] = accel_var;
        }
        self.covariance = a * self.covariance * a.transpose() + b * q * b.transpose();

        // Bias Jacobians (position first: it uses the previous velocity terms)
        let j = &mut self.jacobians;
        j.pos_accel += j.vel_accel * dt - 0.5 * delta_r * dt2;
        j.pos_gyro += j.vel_gyro * dt - 0.5 * delta_r * accel_skew * j.rot_gyro * dt2;
        j.vel_accel -= delta_r * dt;
        j.vel_gyro -= delta_r * accel_skew * j.rot_gyro * dt;
        j.rot_gyro = inc_t * j.rot_gyro - jr * dt;

        // Deltas
        self.state.delta_pos += self.state.delta_vel * dt + 0.5 * delta_r * accel * dt2;
        self.state.delta_vel += delta_r * accel * dt;
        self.state.delta_rot = UnitQuaternion::new_normalize((self.state.delta_rot * inc).into_inner());
        self.state.dt += dt;
    }
}
