//! Map module - Core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature observations
//! - [`MapPoint`] - 3D landmarks observed by KeyFrames
//! - [`Map`] - Container managing KeyFrames, MapPoints, and their relationships
//! - [`KeyFrameSnapshot`] - Detached copies used outside the map lock
//!
//! # Architecture
//!
//! The map forms a bipartite graph structure:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames also maintain the graphs used by loop closing:
//! - **Covisibility Graph**: Edges weighted by shared MapPoint count
//! - **Spanning Tree**: Parent links used to propagate corrections
//! - **Loop Edges**: KeyFrame pairs joined by an accepted loop

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod snapshot;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::{Map, COVISIBILITY_THRESHOLD};
pub use map_point::MapPoint;
pub use snapshot::{KeyFrameSnapshot, LandmarkSnapshot};
pub use types::{descriptor_distance, Descriptor, KeyFrameId, KeyPoint, MapPointId};
