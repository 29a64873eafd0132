//! Map module - the entities the optimizers read and write.
//!
//! - [`KeyFrame`] - a pose of one agent's trajectory with its observations
//! - [`Landmark`] - a 3D point observed by keyframes
//! - [`LoopConstraint`] - an accepted relative-pose measurement between two keyframes
//! - [`Map`] - container keeping keyframe ↔ landmark associations consistent
//!
//! Keyframes reference landmarks by [`LandmarkId`] and landmarks reference
//! keyframes by [`KeyFrameId`]; there are no shared pointers between entities.

pub mod keyframe;
pub mod landmark;
pub mod loop_constraint;
pub mod map;
pub mod types;

pub use keyframe::{KeyFrame, Keypoint};
pub use landmark::Landmark;
pub use loop_constraint::LoopConstraint;
pub use map::{CleanReport, Map};
pub use types::{KeyFrameId, LandmarkId};
