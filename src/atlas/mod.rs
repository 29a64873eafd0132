//! Atlas module - multi-agent map data structures.
//!
//! - [`map`] - keyframes, landmarks, loop constraints and the [`Map`] container
//! - [`atlas`] - per-agent maps behind read/write locks

pub mod atlas;
pub mod map;

pub use atlas::{Atlas, SharedMap};
pub use map::{KeyFrame, KeyFrameId, Keypoint, Landmark, LandmarkId, LoopConstraint, Map};
