//! Reprojection through a relative transform between two cameras.

use nalgebra::{DVector, Vector2, Vector3};

use super::reprojection::project_residual;
use crate::camera::{CameraKernel, Projector};
use crate::optimizer::manifold::pose_from_params;
use crate::optimizer::problem::CostFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativeDirection {
    /// A point of camera 2 is moved into camera 1 with `T_12`.
    Forward,
    /// A point of camera 1 is moved into camera 2 with `T_12⁻¹`.
    Inverse,
}

/// Residual over the single block `[T_12]` for a point fixed in one camera
/// and observed in the other.
#[derive(Debug, Clone)]
pub struct RelativeReprojectionFactor<K = CameraKernel> {
    kernel: K,
    point: Vector3<f64>,
    observed: Vector2<f64>,
    inv_sigma: f64,
    direction: RelativeDirection,
}

impl<K: Projector> RelativeReprojectionFactor<K> {
    pub fn new(
        kernel: K,
        point: Vector3<f64>,
        observed: Vector2<f64>,
        sigma: f64,
        direction: RelativeDirection,
    ) -> Self {
        Self {
            kernel,
            point,
            observed,
            inv_sigma: 1.0 / sigma,
            direction,
        }
    }
}

impl<K: Projector> CostFunction for RelativeReprojectionFactor<K> {
    fn num_residuals(&self) -> usize {
        2
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let t_12 = pose_from_params(params[0]);
        let p_c = match self.direction {
            RelativeDirection::Forward => t_12.transform_point(&self.point),
            RelativeDirection::Inverse => t_12.inverse().transform_point(&self.point),
        };
        project_residual(&self.kernel, &p_c, &self.observed, self.inv_sigma)
    }
}
