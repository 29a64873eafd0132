pub mod preintegration;
pub mod sample;

pub use preintegration::{BiasJacobians, ImuMeasurement, ImuPreintegration, Matrix15, PreintegratedState};
pub use sample::{GRAVITY, ImuBias, ImuNoise, ImuSample};
