//! Core ID and feature types for the map structures.

use serde::{Deserialize, Serialize};

/// Unique identifier for a KeyFrame within a Map.
///
/// KeyFrameIds are assigned sequentially when KeyFrames are created.
/// They serve as lightweight handles for cross-referencing without
/// needing Arc/Rc, which simplifies ownership and avoids cyclic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    /// Create a new KeyFrameId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint within a Map.
///
/// MapPointIds are assigned sequentially when MapPoints are created.
/// A MapPoint represents a 3D landmark observed by one or more KeyFrames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapPointId(pub u64);

impl MapPointId {
    /// Create a new MapPointId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

/// 256-bit binary ORB descriptor.
pub type Descriptor = [u8; 32];

/// Number of differing bits between two ORB descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Undistorted keypoint as produced by the ORB extractor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct KeyPoint {
    pub x: f64,
    pub y: f64,
    pub size: f64,
    /// Orientation in degrees, [0, 360).
    pub angle: f64,
    pub response: f64,
    /// Pyramid level the keypoint was detected at.
    pub octave: usize,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64, octave: usize) -> Self {
        Self {
            x,
            y,
            size: 31.0,
            angle: 0.0,
            response: 0.0,
            octave,
        }
    }
}
