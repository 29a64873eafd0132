//! Reprojection residual of a world point into a keyframe camera.

use nalgebra::{DVector, Vector2, Vector3};

use crate::camera::{CameraKernel, Projector};
use crate::geometry::SE3;
use crate::optimizer::manifold::pose_from_params;
use crate::optimizer::problem::CostFunction;

/// Residual returned for points the camera cannot image. It is constant, so
/// such an observation pulls on nothing but still counts as an outlier.
pub(crate) const UNPROJECTABLE_RESIDUAL: f64 = 100.0;

/// `r = (π(T_sc⁻¹ · T_ws⁻¹ · p_w) − z) / σ` over blocks `[T_ws, p_w]`.
///
/// The pose block may live in any frame, as long as the point block lives in
/// the same one. `K` is normally a concrete camera from
/// [`CameraKernel::dispatch`].
#[derive(Debug, Clone)]
pub struct ReprojectionFactor<K = CameraKernel> {
    kernel: K,
    t_cs: SE3,
    observed: Vector2<f64>,
    inv_sigma: f64,
}

impl<K: Projector> ReprojectionFactor<K> {
    pub fn new(kernel: K, extrinsics: &SE3, observed: Vector2<f64>, sigma: f64) -> Self {
        Self {
            kernel,
            t_cs: extrinsics.inverse(),
            observed,
            inv_sigma: 1.0 / sigma,
        }
    }
}

impl<K: Projector> CostFunction for ReprojectionFactor<K> {
    fn num_residuals(&self) -> usize {
        2
    }

    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
        let t_ws = pose_from_params(params[0]);
        let p_w = Vector3::new(params[1][0], params[1][1], params[1][2]);
        let p_s = t_ws.inverse().transform_point(&p_w);
        let p_c = self.t_cs.transform_point(&p_s);
        project_residual(&self.kernel, &p_c, &self.observed, self.inv_sigma)
    }
}

pub(crate) fn project_residual<K: Projector>(
    kernel: &K,
    p_c: &Vector3<f64>,
    observed: &Vector2<f64>,
    inv_sigma: f64,
) -> DVector<f64> {
    match kernel.project(p_c) {
        Some(uv) => {
            let e = (uv - observed) * inv_sigma;
            DVector::from_vec(vec![e.x, e.y])
        }
        None => DVector::from_element(2, UNPROJECTABLE_RESIDUAL),
    }
}
