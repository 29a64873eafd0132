pub mod atlas;
pub mod camera;
pub mod config;
pub mod error;
pub mod geometry;
pub mod imu;
pub mod logger;
pub mod optimizer;
