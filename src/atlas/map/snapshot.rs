//! Detached, read-only copies of a keyframe and the landmarks it observes.
//!
//! Matching and Sim3 estimation run on snapshots so that no map lock is held
//! while they execute. Remote keyframes received from other robots are
//! reconstructed directly as snapshots and never enter the local map.

use std::sync::Arc;

use nalgebra::Vector3;

use crate::geometry::{CameraModel, ScalePyramid, SE3};
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{Descriptor, KeyFrameId, KeyPoint, MapPointId};

/// A landmark as seen from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSnapshot {
    pub id: MapPointId,
    /// World position in the owning map's frame.
    pub position: Vector3<f64>,
    pub descriptor: Descriptor,
    pub normal: Vector3<f64>,
    pub min_distance: f64,
    pub max_distance: f64,
}

impl LandmarkSnapshot {
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }
}

#[derive(Debug, Clone)]
pub struct KeyFrameSnapshot {
    pub id: KeyFrameId,
    pub timestamp_ns: u64,
    /// T_wc
    pub pose: SE3,
    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub bow_vector: BowVector,
    pub feature_vector: FeatureVector,
    /// Landmark per feature, `None` when the feature has no correspondence.
    pub landmarks: Vec<Option<LandmarkSnapshot>>,
}

impl KeyFrameSnapshot {
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }

    pub fn landmark(&self, feature_idx: usize) -> Option<&LandmarkSnapshot> {
        self.landmarks.get(feature_idx).and_then(|l| l.as_ref())
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.iter().filter(|l| l.is_some()).count()
    }

    /// Indices of features within `radius` pixels of (u, v), optionally
    /// restricted to a range of pyramid levels (both bounds inclusive).
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<usize>,
        max_level: Option<usize>,
    ) -> Vec<usize> {
        let radius_sq = radius * radius;
        self.keypoints
            .iter()
            .enumerate()
            .filter(|(_, kp)| min_level.map_or(true, |min| kp.octave >= min))
            .filter(|(_, kp)| max_level.map_or(true, |max| kp.octave <= max))
            .filter(|(_, kp)| {
                let du = kp.x - u;
                let dv = kp.y - v;
                du * du + dv * dv <= radius_sq
            })
            .map(|(i, _)| i)
            .collect()
    }
}
