//! Robust loss functions.
//!
//! A loss maps the squared residual norm `s = ||r||²` to a robust cost `ρ(s)`.
//! The solver minimizes `½ Σ ρ(sᵢ)` and linearizes each residual block
//! through a [`Corrector`] so that a plain Gauss-Newton step on the corrected
//! residual and Jacobian is a step on the robust objective.

use crate::error::{OptimizerError, OptimizerResult};

/// `evaluate` returns `[ρ(s), ρ'(s), ρ''(s)]`, with `ρ(0) = 0` and `ρ'(0) = 1`.
pub trait Loss: Send + Sync {
    fn evaluate(&self, s: f64) -> [f64; 3];
}

/// `ρ(s) = b log(1 + s/b)` with `b = scale²`.
#[derive(Debug, Clone, Copy)]
pub struct CauchyLoss {
    b: f64,
    inv_b: f64,
}

impl CauchyLoss {
    pub fn new(scale: f64) -> OptimizerResult<Self> {
        if !(scale > 0.0) {
            return Err(OptimizerError::Config(format!("Cauchy scale must be positive, got {scale}")));
        }
        let b = scale * scale;
        Ok(Self { b, inv_b: 1.0 / b })
    }
}

impl Loss for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.inv_b;
        let inv = 1.0 / sum;
        [self.b * sum.ln(), inv, -self.inv_b * inv * inv]
    }
}

/// Quadratic below `scale`, linear in the residual norm above it:
/// `ρ(s) = s` for `s ≤ b`, `2√(bs) − b` otherwise, `b = scale²`.
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    b: f64,
}

impl HuberLoss {
    pub fn new(scale: f64) -> OptimizerResult<Self> {
        if !(scale > 0.0) {
            return Err(OptimizerError::Config(format!("Huber scale must be positive, got {scale}")));
        }
        Ok(Self { b: scale * scale })
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.b {
            let r = s.sqrt();
            let rho1 = (self.b / s).sqrt();
            [2.0 * self.b.sqrt() * r - self.b, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Rescales a residual block and its Jacobian so that the normal equations of
/// the corrected block approximate the Hessian of `½ρ(||r||²)`.
///
/// With `α` the root of `½α² − α − (ρ''/ρ')·s = 0`:
///
/// ```text
/// r̃ = √ρ' / (1 − α) · r
/// J̃ = √ρ' · (I − α r rᵀ / s) · J
/// ```
///
/// When `ρ'' ≤ 0` (or `s = 0`) the second-order term is dropped and both are
/// scaled by `√ρ'`, which keeps the approximate Hessian positive semi-definite.
#[derive(Debug, Clone, Copy)]
pub struct Corrector {
    sqrt_rho1: f64,
    residual_scaling: f64,
    alpha_sq_norm: f64,
}

impl Corrector {
    pub fn new(sq_norm: f64, rho: &[f64; 3]) -> Self {
        let sqrt_rho1 = rho[1].sqrt();
        if sq_norm == 0.0 || rho[2] <= 0.0 {
            return Self {
                sqrt_rho1,
                residual_scaling: sqrt_rho1,
                alpha_sq_norm: 0.0,
            };
        }
        let d = 1.0 + 2.0 * sq_norm * rho[2] / rho[1];
        let alpha = 1.0 - d.max(0.0).sqrt();
        Self {
            sqrt_rho1,
            residual_scaling: sqrt_rho1 / (1.0 - alpha),
            alpha_sq_norm: alpha / sq_norm,
        }
    }

    pub fn correct_residuals(&self, residuals: &mut nalgebra::DVector<f64>) {
        *residuals *= self.residual_scaling;
    }

    /// Must be called with the uncorrected residuals.
    pub fn correct_jacobian(&self, residuals: &nalgebra::DVector<f64>, jacobian: &mut nalgebra::DMatrix<f64>) {
        if self.alpha_sq_norm == 0.0 {
            *jacobian *= self.sqrt_rho1;
            return;
        }
        let rt_j = residuals.transpose() * &*jacobian;
        let correction = residuals * rt_j * self.alpha_sq_norm;
        *jacobian -= correction;
        *jacobian *= self.sqrt_rho1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};

    fn check_derivatives(loss: &dyn Loss, s: f64) {
        let h = 1e-6;
        let [rho, rho1, rho2] = loss.evaluate(s);
        let [rho_p, rho1_p, _] = loss.evaluate(s + h);
        let [rho_m, rho1_m, _] = loss.evaluate(s - h);
        assert!(rho.is_finite());
        assert_relative_eq!(rho1, (rho_p - rho_m) / (2.0 * h), epsilon = 1e-6);
        assert_relative_eq!(rho2, (rho1_p - rho1_m) / (2.0 * h), epsilon = 1e-6);
    }

    #[test]
    fn test_cauchy_derivatives() {
        let loss = CauchyLoss::new(1.0).unwrap();
        for s in [0.1, 1.0, 4.0, 100.0] {
            check_derivatives(&loss, s);
        }
        assert_eq!(loss.evaluate(0.0), [0.0, 1.0, -1.0]);
    }

    #[test]
    fn test_huber_regions() {
        let loss = HuberLoss::new(0.1).unwrap();
        assert_eq!(loss.evaluate(0.005), [0.005, 1.0, 0.0]);
        let [rho, rho1, _] = loss.evaluate(1.0);
        assert_relative_eq!(rho, 2.0 * 0.1 - 0.01, epsilon = 1e-12);
        assert_relative_eq!(rho1, 0.1, epsilon = 1e-12);
        check_derivatives(&loss, 0.5);
    }

    #[test]
    fn test_invalid_scale() {
        assert!(CauchyLoss::new(0.0).is_err());
        assert!(HuberLoss::new(-1.0).is_err());
    }

    #[test]
    fn test_corrector_trivial_loss_is_identity() {
        let r = DVector::from_vec(vec![0.3, -0.4]);
        let mut corrected = r.clone();
        let mut jac = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let original = jac.clone();
        let corrector = Corrector::new(r.norm_squared(), &[r.norm_squared(), 1.0, 0.0]);
        corrector.correct_jacobian(&r, &mut jac);
        corrector.correct_residuals(&mut corrected);
        assert_relative_eq!(corrected, r, epsilon = 1e-15);
        assert_relative_eq!(jac, original, epsilon = 1e-15);
    }

    #[test]
    fn test_corrector_cauchy_scales_by_sqrt_rho1() {
        let loss = CauchyLoss::new(1.0).unwrap();
        let r = DVector::from_vec(vec![3.0, 4.0]);
        let s = r.norm_squared();
        let mut corrected = r.clone();
        Corrector::new(s, &loss.evaluate(s)).correct_residuals(&mut corrected);
        assert_relative_eq!(corrected.norm_squared(), s / (1.0 + s), epsilon = 1e-12);
    }
}
