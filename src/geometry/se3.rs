//! Rigid-body transforms.
//!
//! `SE3` stores a unit quaternion and a translation. Naming follows the
//! `T_ab` convention: `T_ab.transform_point(p_b)` expresses `p_b` in frame `a`,
//! and `T_ab.compose(&T_bc) == T_ac`.

use std::ops::Mul;

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self { rotation, translation }
    }

    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self { rotation: UnitQuaternion::identity(), translation }
    }

    /// Builds a transform from a rotation vector (axis * angle) and translation.
    pub fn from_scaled_axis(axis_angle: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(axis_angle),
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    #[inline]
    pub fn rotate_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        *self.rotation.to_rotation_matrix().matrix()
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Relative transform `self⁻¹ · other`.
    pub fn between(&self, other: &SE3) -> SE3 {
        self.inverse().compose(other)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

impl Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> SE3 {
        SE3::from_scaled_axis(Vector3::new(0.1, -0.4, 0.25), Vector3::new(1.0, 2.0, -0.5))
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let t = sample();
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_matrix_product() {
        let a = sample();
        let b = SE3::from_scaled_axis(Vector3::new(-0.3, 0.0, 0.9), Vector3::new(0.0, -1.0, 3.0));
        assert_relative_eq!((a * b).to_matrix(), a.to_matrix() * b.to_matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_between() {
        let a = sample();
        let b = SE3::from_translation(Vector3::new(4.0, 0.0, 0.0));
        let rel = a.between(&b);
        let b_again = a.compose(&rel);
        assert_relative_eq!(b_again.translation, b.translation, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_point() {
        let t = SE3::from_scaled_axis(
            Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let p = t.transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(p, Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-12);
    }
}
