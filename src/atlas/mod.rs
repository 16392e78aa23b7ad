//! Map graph and place recognition database.
//!
//! - [`map::KeyFrame`] - KeyFrames with covisibility and spanning tree
//! - [`map::MapPoint`] - 3D landmarks with observation tracking
//! - [`map::Map`] - Container with association and fusion operations
//! - [`keyframe_db::KeyFrameDatabase`] - BoW inverted file for loop candidates

pub mod keyframe_db;
pub mod map;

pub use keyframe_db::{Candidate, KeyFrameDatabase};
pub use map::{KeyFrame, KeyFrameId, KeyFrameSnapshot, LandmarkSnapshot, Map, MapPoint, MapPointId};
