//! Projection kernels.
//!
//! A [`CameraKernel`] is a fully-resolved (projection, distortion) pair with its
//! parameters inlined. Residuals do not project through the enum: at build
//! time [`CameraKernel::dispatch`] matches it once and hands the visitor a
//! concrete [`Camera`], so the solver only ever runs monomorphized projection
//! code.

use std::fmt::Debug;

use nalgebra::{Vector2, Vector3};

/// Points closer than this to the projection singularity are not projected.
const MIN_DENOMINATOR: f64 = 1e-6;

/// Maps a camera-frame point to normalized image coordinates and normalized
/// coordinates to pixels.
pub trait ProjectionModel: Copy + Send + Sync + Debug + 'static {
    fn normalize(&self, p_c: &Vector3<f64>) -> Option<Vector2<f64>>;
    fn to_pixels(&self, m: &Vector2<f64>) -> Vector2<f64>;
}

pub trait DistortionModel: Copy + Send + Sync + Debug + 'static {
    /// Applies the distortion to normalized image coordinates.
    fn distort(&self, p: &Vector2<f64>) -> Vector2<f64>;
}

/// Anything residuals can project through.
pub trait Projector: Copy + Send + Sync + Debug + 'static {
    /// Projects a point in camera coordinates to distorted pixel coordinates.
    /// Returns `None` when the point cannot be imaged.
    fn project(&self, p_c: &Vector3<f64>) -> Option<Vector2<f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pinhole {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// Unified (Mei) model: the point is first projected on the unit sphere,
/// then pinhole-projected from a center shifted by `xi`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unified {
    pub xi: f64,
    pub pinhole: Pinhole,
}

/// Kannala-Brandt: `θd = θ (1 + k1 θ² + k2 θ⁴ + k3 θ⁶ + k4 θ⁸)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equidistant {
    pub k: [f64; 4],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadTan {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
}

/// FOV model with field-of-view parameter `w`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fov {
    pub w: f64,
}

impl ProjectionModel for Pinhole {
    #[inline]
    fn normalize(&self, p_c: &Vector3<f64>) -> Option<Vector2<f64>> {
        (p_c.z > MIN_DENOMINATOR).then(|| Vector2::new(p_c.x / p_c.z, p_c.y / p_c.z))
    }

    #[inline]
    fn to_pixels(&self, m: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(self.fx * m.x + self.cx, self.fy * m.y + self.cy)
    }
}

impl ProjectionModel for Unified {
    #[inline]
    fn normalize(&self, p_c: &Vector3<f64>) -> Option<Vector2<f64>> {
        let denom = p_c.z + self.xi * p_c.norm();
        (denom > MIN_DENOMINATOR).then(|| Vector2::new(p_c.x / denom, p_c.y / denom))
    }

    #[inline]
    fn to_pixels(&self, m: &Vector2<f64>) -> Vector2<f64> {
        self.pinhole.to_pixels(m)
    }
}

impl DistortionModel for RadTan {
    fn distort(&self, p: &Vector2<f64>) -> Vector2<f64> {
        let Self { k1, k2, p1, p2 } = *self;
        let (x, y) = (p.x, p.y);
        let mx2 = x * x;
        let my2 = y * y;
        let mxy = x * y;
        let r2 = mx2 + my2;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        Vector2::new(
            x * radial + 2.0 * p1 * mxy + p2 * (r2 + 2.0 * mx2),
            y * radial + p1 * (r2 + 2.0 * my2) + 2.0 * p2 * mxy,
        )
    }
}

impl DistortionModel for Equidistant {
    fn distort(&self, p: &Vector2<f64>) -> Vector2<f64> {
        let k = &self.k;
        let r = p.norm();
        if r < 1e-8 {
            return *p;
        }
        let theta = r.atan();
        let theta2 = theta * theta;
        let theta4 = theta2 * theta2;
        let theta6 = theta4 * theta2;
        let theta8 = theta4 * theta4;
        let theta_d = theta * (1.0 + k[0] * theta2 + k[1] * theta4 + k[2] * theta6 + k[3] * theta8);
        p * (theta_d / r)
    }
}

impl DistortionModel for Fov {
    fn distort(&self, p: &Vector2<f64>) -> Vector2<f64> {
        let w = self.w;
        let r = p.norm();
        let factor = if w * w < 1e-5 {
            1.0
        } else if r * r < 1e-5 {
            2.0 * (w / 2.0).tan() / w
        } else {
            (r * 2.0 * (w / 2.0).tan()).atan() / (w * r)
        };
        p * factor
    }
}

/// A statically-typed (projection, distortion) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera<P, D> {
    pub projection: P,
    pub distortion: D,
}

impl<P: ProjectionModel, D: DistortionModel> Projector for Camera<P, D> {
    #[inline]
    fn project(&self, p_c: &Vector3<f64>) -> Option<Vector2<f64>> {
        let m = self.projection.normalize(p_c)?;
        Some(self.projection.to_pixels(&self.distortion.distort(&m)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Pinhole { fx: f64, fy: f64, cx: f64, cy: f64 },
    UnifiedProjection { xi: f64, fx: f64, fy: f64, cx: f64, cy: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distortion {
    Equidistant { k: [f64; 4] },
    RadTan { k1: f64, k2: f64, p1: f64, p2: f64 },
    Fisheye { w: f64 },
}

/// Receives the concrete camera behind a [`CameraKernel`].
pub trait KernelVisitor {
    type Output;

    fn visit<K: Projector>(self, camera: K) -> Self::Output;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraKernel {
    pub projection: Projection,
    pub distortion: Distortion,
}

impl CameraKernel {
    /// The one place the (projection, distortion) pair is matched.
    pub fn dispatch<V: KernelVisitor>(&self, visitor: V) -> V::Output {
        match self.projection {
            Projection::Pinhole { fx, fy, cx, cy } => {
                with_distortion(Pinhole { fx, fy, cx, cy }, self.distortion, visitor)
            }
            Projection::UnifiedProjection { xi, fx, fy, cx, cy } => {
                let projection = Unified { xi, pinhole: Pinhole { fx, fy, cx, cy } };
                with_distortion(projection, self.distortion, visitor)
            }
        }
    }
}

fn with_distortion<P, V>(projection: P, distortion: Distortion, visitor: V) -> V::Output
where
    P: ProjectionModel,
    V: KernelVisitor,
{
    match distortion {
        Distortion::Equidistant { k } => visitor.visit(Camera { projection, distortion: Equidistant { k } }),
        Distortion::RadTan { k1, k2, p1, p2 } => {
            visitor.visit(Camera { projection, distortion: RadTan { k1, k2, p1, p2 } })
        }
        Distortion::Fisheye { w } => visitor.visit(Camera { projection, distortion: Fov { w } }),
    }
}

struct ProjectOnce<'a>(&'a Vector3<f64>);

impl KernelVisitor for ProjectOnce<'_> {
    type Output = Option<Vector2<f64>>;

    fn visit<K: Projector>(self, camera: K) -> Self::Output {
        camera.project(self.0)
    }
}

/// Dispatches on every call. Fine for one-off projections; residuals should
/// be built through [`CameraKernel::dispatch`] instead.
impl Projector for CameraKernel {
    fn project(&self, p_c: &Vector3<f64>) -> Option<Vector2<f64>> {
        self.dispatch(ProjectOnce(p_c))
    }
}

impl DistortionModel for Distortion {
    fn distort(&self, p: &Vector2<f64>) -> Vector2<f64> {
        match *self {
            Distortion::Equidistant { k } => Equidistant { k }.distort(p),
            Distortion::RadTan { k1, k2, p1, p2 } => RadTan { k1, k2, p1, p2 }.distort(p),
            Distortion::Fisheye { w } => Fov { w }.distort(p),
        }
    }
}
