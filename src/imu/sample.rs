use nalgebra::Vector3;

/// Gravity vector in world frame (m/s^2).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// IMU noise densities (continuous time, 1-sigma).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuNoise {
    /// Gyroscope white noise, rad/s/√Hz.
    pub sigma_gyro: f64,
    /// Accelerometer white noise, m/s²/√Hz.
    pub sigma_accel: f64,
    /// Gyroscope bias random walk, rad/s²/√Hz.
    pub sigma_gyro_walk: f64,
    /// Accelerometer bias random walk, m/s³/√Hz.
    pub sigma_accel_walk: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        // EuRoC (ADIS16448) datasheet values
        Self {
            sigma_gyro: 1.7e-4,
            sigma_accel: 2.0e-3,
            sigma_gyro_walk: 1.9e-5,
            sigma_accel_walk: 3.0e-3,
        }
    }
}

/// IMU biases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuBias {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

impl ImuBias {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self { accel, gyro }
    }

    pub fn zero() -> Self {
        Self {
            accel: Vector3::zeros(),
            gyro: Vector3::zeros(),
        }
    }
}

impl Default for ImuBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// Single IMU measurement.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    pub timestamp_s: f64,
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}
