//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! Each MapPoint tracks which KeyFrames observe it and stores the viewing
//! geometry used to predict at which pyramid level it should be re-detected.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::{Descriptor, KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative ORB descriptor (the observation with the least median
    /// distance to all others).
    pub descriptor: Descriptor,

    /// observations[kf_id] = feature_idx means keyframe kf_id sees this point at feature_idx.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale invariance distance range.
    pub min_distance: f64,
    pub max_distance: f64,

    /// KeyFrame the point is anchored to. Corrections of that keyframe's pose
    /// are carried over to the point.
    pub ref_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        ref_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            ref_kf_id,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if the observation existed and was removed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Update the mean normal vector and distance bounds.
    ///
    /// # Arguments
    /// * `kf_centers` - camera centers of the observing KeyFrames
    /// * `ref_center` - camera center of the reference KeyFrame
    /// * `ref_level_scale` - scale of the pyramid level the reference KeyFrame saw the point at
    /// * `max_level_scale` - scale of the coarsest pyramid level
    pub fn update_normal_and_depth(
        &mut self,
        kf_centers: impl Iterator<Item = Vector3<f64>>,
        ref_center: &Vector3<f64>,
        ref_level_scale: f64,
        max_level_scale: f64,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut count = 0usize;
        for center in kf_centers {
            let dir = self.position - center;
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                count += 1;
            }
        }
        if count > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                self.normal = normal_sum / norm;
            }
        }

        let dist = (self.position - ref_center).norm();
        self.max_distance = dist * ref_level_scale;
        self.min_distance = self.max_distance / max_level_scale;
    }

    /// Check if a viewing distance is within the valid range (with the
    /// customary 20% slack on both ends).
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= 0.8 * self.min_distance && distance <= 1.2 * self.max_distance
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("ref_kf_id", &self.ref_kf_id)
            .field("is_bad", &self.is_bad)
            .finish()
    }
}
