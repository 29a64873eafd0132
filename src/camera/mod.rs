//! Camera models.
//!
//! A keyframe carries a [`CameraModel`]: a projection kind, a distortion kind and
//! their raw parameter vectors, exactly as read from a calibration. Before any
//! residual is built the model is resolved into a [`CameraKernel`]; unsupported
//! combinations fail there, once per keyframe.
//!
//! Supported: {pinhole, unified projection} × {equidistant, radtan, fisheye}.

pub mod kernel;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, OptimizerResult};

pub use kernel::{
    Camera, CameraKernel, Distortion, DistortionModel, Equidistant, Fov, KernelVisitor, Pinhole, Projection,
    ProjectionModel, Projector, RadTan, Unified,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    Pinhole,
    UnifiedProjection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionKind {
    /// No distortion model. Calibrations can carry it, but reprojection
    /// residuals cannot be built from it.
    None,
    Equidistant,
    RadTan,
    Fisheye,
}

impl FromStr for ProjectionKind {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pinhole" => Ok(ProjectionKind::Pinhole),
            "unified" | "unified_projection" | "omni" => Ok(ProjectionKind::UnifiedProjection),
            _ => Err(OptimizerError::UnknownCameraType(s.to_string())),
        }
    }
}

impl FromStr for DistortionKind {
    type Err = OptimizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(DistortionKind::None),
            "equidistant" | "kannala_brandt" => Ok(DistortionKind::Equidistant),
            "radtan" | "radial_tangential" | "plumb_bob" => Ok(DistortionKind::RadTan),
            "fisheye" | "fov" => Ok(DistortionKind::Fisheye),
            _ => Err(OptimizerError::UnknownDistortionType(s.to_string())),
        }
    }
}

impl fmt::Display for DistortionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistortionKind::None => "none",
            DistortionKind::Equidistant => "equidistant",
            DistortionKind::RadTan => "radtan",
            DistortionKind::Fisheye => "fisheye",
        };
        f.write_str(name)
    }
}

/// Camera description as it appears in a calibration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub projection_type: String,
    pub intrinsics: Vec<f64>,
    pub distortion_type: String,
    #[serde(default)]
    pub distortion_params: Vec<f64>,
}

/// Per-keyframe camera. Never optimized.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    pub projection: ProjectionKind,
    /// `[fx, fy, cx, cy]` for pinhole, `[xi, fx, fy, cx, cy]` for unified.
    pub intrinsics: Vec<f64>,
    pub distortion: DistortionKind,
    /// `[k1..k4]` equidistant, `[k1, k2, p1, p2]` radtan, `[w]` fisheye.
    pub distortion_params: Vec<f64>,
}

impl CameraModel {
    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            projection: ProjectionKind::Pinhole,
            intrinsics: vec![fx, fy, cx, cy],
            distortion: DistortionKind::RadTan,
            distortion_params: vec![0.0; 4],
        }
    }

    pub fn with_distortion(mut self, distortion: DistortionKind, params: Vec<f64>) -> Self {
        self.distortion = distortion;
        self.distortion_params = params;
        self
    }

    pub fn from_config(config: &CameraConfig) -> OptimizerResult<Self> {
        Ok(Self {
            projection: config.projection_type.parse()?,
            intrinsics: config.intrinsics.clone(),
            distortion: config.distortion_type.parse()?,
            distortion_params: config.distortion_params.clone(),
        })
    }

    /// Resolves the model into a projection kernel.
    pub fn resolve(&self) -> OptimizerResult<CameraKernel> {
        let projection = match self.projection {
            ProjectionKind::Pinhole => {
                let [fx, fy, cx, cy] = fixed_params::<4>(&self.intrinsics, "pinhole intrinsics")?;
                Projection::Pinhole { fx, fy, cx, cy }
            }
            ProjectionKind::UnifiedProjection => {
                let [xi, fx, fy, cx, cy] =
                    fixed_params::<5>(&self.intrinsics, "unified projection intrinsics")?;
                Projection::UnifiedProjection { xi, fx, fy, cx, cy }
            }
        };

        let distortion = match self.distortion {
            DistortionKind::Equidistant => Distortion::Equidistant {
                k: fixed_params::<4>(&self.distortion_params, "equidistant coefficients")?,
            },
            DistortionKind::RadTan => {
                let [k1, k2, p1, p2] =
                    fixed_params::<4>(&self.distortion_params, "radtan coefficients")?;
                Distortion::RadTan { k1, k2, p1, p2 }
            }
            DistortionKind::Fisheye => {
                let [w] = fixed_params::<1>(&self.distortion_params, "fisheye coefficient")?;
                Distortion::Fisheye { w }
            }
            DistortionKind::None => {
                return Err(OptimizerError::UnknownDistortionType(self.distortion.to_string()));
            }
        };

        Ok(CameraKernel { projection, distortion })
    }
}

fn fixed_params<const N: usize>(values: &[f64], what: &str) -> OptimizerResult<[f64; N]> {
    <[f64; N]>::try_from(values).map_err(|_| {
        OptimizerError::InvalidCameraParameters(format!(
            "{what}: expected {N} values, got {}",
            values.len()
        ))
    })
}
