//! Error types for the optimization engine.

use thiserror::Error;

use crate::atlas::map::{KeyFrameId, LandmarkId};

/// Errors raised while building, solving or writing back a problem.
///
/// Structural violations (a broken keyframe chain, a residual referring to a
/// block that was never staged, an unsupported camera) mean the map is corrupt.
/// They are reported through [`OptimizerError::is_fatal`] and must not be
/// absorbed by the caller.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("keyframe {kf} has no valid predecessor")]
    MissingPredecessor { kf: KeyFrameId },

    #[error("parameter block missing: {0}")]
    MissingParameterBlock(String),

    #[error("unknown projection type: {0}")]
    UnknownCameraType(String),

    #[error("unknown distortion type: {0}")]
    UnknownDistortionType(String),

    #[error("invalid camera parameters: {0}")]
    InvalidCameraParameters(String),

    #[error("reference keyframe {kf} of landmark {landmark} has no uncorrected pose")]
    MissingReferencePose { kf: KeyFrameId, landmark: LandmarkId },

    #[error("unknown keyframe {0}")]
    UnknownKeyFrame(KeyFrameId),

    #[error("invalid optimization window: {0}")]
    InvalidWindow(String),

    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("diagnostics output failed: {0}")]
    Diagnostics(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl OptimizerError {
    /// Whether this error signals a corrupted map that the process must not
    /// continue with.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OptimizerError::MissingPredecessor { .. }
                | OptimizerError::MissingParameterBlock(_)
                | OptimizerError::UnknownCameraType(_)
                | OptimizerError::UnknownDistortionType(_)
                | OptimizerError::InvalidCameraParameters(_)
                | OptimizerError::MissingReferencePose { .. }
        )
    }
}

impl From<serde_yaml::Error> for OptimizerError {
    fn from(err: serde_yaml::Error) -> Self {
        OptimizerError::Config(err.to_string())
    }
}

impl From<csv::Error> for OptimizerError {
    fn from(err: csv::Error) -> Self {
        OptimizerError::Diagnostics(err.to_string())
    }
}

pub type OptimizerResult<T> = Result<T, OptimizerError>;
