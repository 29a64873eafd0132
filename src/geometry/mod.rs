//! Geometry utilities: SE3 transforms and SO3 helpers.

pub mod se3;
pub mod so3;

pub use se3::SE3;
pub use so3::{normalize_angle, right_jacobian_so3, rotation_to_ypr, skew, ypr_to_matrix, ypr_to_rotation};
