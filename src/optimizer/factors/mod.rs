//! Residual blocks used by the optimizers.

mod between;
mod four_dof;
mod imu;
mod relative_reprojection;
mod reprojection;

pub use between::BetweenFactor;
pub use four_dof::FourDofFactor;
pub use imu::{bias_from_params, bias_to_params, ImuFactor, BIAS_SIZE};
pub use relative_reprojection::{RelativeDirection, RelativeReprojectionFactor};
pub use reprojection::ReprojectionFactor;
