//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is the central data structure that holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - Covisibility, spanning tree and loop edges between KeyFrames
//!
//! Landmarks merged during loop correction leave a forwarding entry behind,
//! so stale ids held by other components can still be resolved to the
//! surviving point.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;

use crate::geometry::{CameraModel, ScalePyramid, SE3};

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::snapshot::{KeyFrameSnapshot, LandmarkSnapshot};
use super::types::{descriptor_distance, Descriptor, KeyFrameId, KeyPoint, MapPointId};

/// Minimum number of shared points for a covisibility edge to be kept by
/// `update_connections`.
pub const COVISIBILITY_THRESHOLD: usize = 15;

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    /// Retired MapPoint → the point that replaced it.
    replacements: HashMap<MapPointId, MapPointId>,

    next_kf_id: u64,
    next_mp_id: u64,

    /// First KeyFrame inserted; root of the spanning tree.
    origin_kf_id: Option<KeyFrameId>,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            replacements: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            origin_kf_id: None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ID Generation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn next_keyframe_id(&mut self) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    pub fn next_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create and add a new KeyFrame to the map.
    pub fn create_keyframe(
        &mut self,
        timestamp_ns: u64,
        pose: SE3,
        camera: CameraModel,
        pyramid: Arc<ScalePyramid>,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
    ) -> KeyFrameId {
        let id = self.next_keyframe_id();
        let kf = KeyFrame::new(id, timestamp_ns, pose, camera, pyramid, keypoints, descriptors);
        self.add_keyframe(kf);
        id
    }

    /// Add an existing KeyFrame to the map.
    pub fn add_keyframe(&mut self, kf: KeyFrame) {
        if kf.id.0 >= self.next_kf_id {
            self.next_kf_id = kf.id.0 + 1;
        }
        if self.origin_kf_id.is_none() {
            self.origin_kf_id = Some(kf.id);
        }
        self.keyframes.insert(kf.id, kf);
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = &KeyFrameId> {
        self.keyframes.keys()
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn origin_keyframe_id(&self) -> Option<KeyFrameId> {
        self.origin_kf_id
    }

    /// Rewrite a KeyFrame pose (T_wc). Returns false for unknown ids.
    pub fn set_keyframe_pose(&mut self, id: KeyFrameId, pose: SE3) -> bool {
        match self.keyframes.get_mut(&id) {
            Some(kf) => {
                kf.pose = pose;
                true
            }
            None => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        ref_kf_id: KeyFrameId,
    ) -> MapPointId {
        let id = self.next_map_point_id();
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, ref_kf_id));
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Follow the replacement chain of a possibly retired MapPoint to the
    /// point that survives today. Returns `None` if the chain ends in a
    /// point that no longer exists.
    pub fn resolve_map_point(&self, id: MapPointId) -> Option<MapPointId> {
        let mut current = id;
        // Chains are acyclic; the bound only guards against corrupted input.
        for _ in 0..=self.replacements.len() {
            if self.map_points.contains_key(&current) {
                return Some(current);
            }
            current = *self.replacements.get(&current)?;
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// Covisibility weights with every KeyFrame already observing the point
    /// are incremented. Returns true if the association was created.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let in_range = self
            .keyframes
            .get(&kf_id)
            .map_or(false, |kf| feature_idx < kf.num_features());
        let Some(mp) = self.map_points.get(&mp_id) else {
            return false;
        };
        // A point is seen at most once per KeyFrame.
        if !in_range || mp.observations.get(&kf_id).map_or(false, |&idx| idx != feature_idx) {
            return false;
        }
        if self.keyframes[&kf_id].get_map_point(feature_idx).is_some() {
            self.disassociate(kf_id, feature_idx);
        }

        let existing_observers: Vec<KeyFrameId> = self.map_points[&mp_id]
            .observations
            .keys()
            .copied()
            .filter(|&id| id != kf_id)
            .collect();

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_kf_id in existing_observers {
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }

        true
    }

    /// Remove the association between a KeyFrame feature and its MapPoint,
    /// decrementing covisibility with the remaining observers.
    ///
    /// Returns the MapPoint ID that was disassociated, if any.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.get_map_point(feature_idx)?;

        let other_observers: Vec<KeyFrameId> = self
            .map_points
            .get(&mp_id)
            .map(|mp| {
                mp.observations
                    .keys()
                    .filter(|&&id| id != kf_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.erase_map_point(feature_idx);
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }

        for other_kf_id in other_observers {
            let current_weight = self
                .keyframes
                .get(&other_kf_id)
                .map(|kf| kf.get_covisibility_weight(kf_id))
                .unwrap_or(0);

            if current_weight <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other_kf_id);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.erase_covisibility(kf_id);
                }
            } else {
                let new_weight = current_weight - 1;
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.add_covisibility(other_kf_id, new_weight);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.add_covisibility(kf_id, new_weight);
                }
            }
        }

        Some(mp_id)
    }

    /// Merge `old` into `new`: every observer of `old` is repointed to `new`
    /// (or simply dropped if it already observes `new`), then `old` is
    /// retired and a forwarding entry is recorded.
    ///
    /// Returns false if either point is missing or they are the same point.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) -> bool {
        if old == new || !self.map_points.contains_key(&new) {
            return false;
        }
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get(&old) {
            Some(mp) => mp.observations.iter().map(|(k, i)| (*k, *i)).collect(),
            None => return false,
        };

        for (kf_id, feature_idx) in observations {
            self.disassociate(kf_id, feature_idx);
            let already_observes = self.map_points[&new].is_observed_by(kf_id);
            if !already_observes {
                self.associate(kf_id, feature_idx, new);
            }
        }

        if let Some(mut retired) = self.map_points.remove(&old) {
            retired.set_bad();
        }
        self.replacements.insert(old, new);
        self.compute_distinctive_descriptor(new);
        true
    }

    /// Fully remove a MapPoint, cleaning up all associations.
    pub fn remove_map_point_full(&mut self, mp_id: MapPointId) {
        let observations: Vec<(KeyFrameId, usize)> = self
            .map_points
            .get(&mp_id)
            .map(|mp| mp.observations.iter().map(|(k, i)| (*k, *i)).collect())
            .unwrap_or_default();
        for (kf_id, feature_idx) in observations {
            self.disassociate(kf_id, feature_idx);
        }
        self.map_points.remove(&mp_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute the covisibility edges of a KeyFrame from its current
    /// observations, and attach it to the spanning tree if it has no parent.
    ///
    /// Edges weaker than `COVISIBILITY_THRESHOLD` are dropped unless there is
    /// no stronger one, in which case the best edge is kept so the KeyFrame
    /// never becomes disconnected.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.get_map_point_indices() {
            let Some(mp) = self.map_points.get(&mp_id) else {
                continue;
            };
            for &observer in mp.observations.keys() {
                if observer != kf_id {
                    *counter.entry(observer).or_insert(0) += 1;
                }
            }
        }
        if counter.is_empty() {
            return;
        }

        let best = counter
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, w)| (*id, *w));
        let mut kept: HashMap<KeyFrameId, usize> = counter
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_THRESHOLD)
            .map(|(id, w)| (*id, *w))
            .collect();
        if kept.is_empty() {
            if let Some((id, w)) = best {
                kept.insert(id, w);
            }
        }

        let previous: Vec<KeyFrameId> = self.keyframes[&kf_id]
            .covisibility_weights()
            .keys()
            .copied()
            .collect();
        for other in previous {
            if !kept.contains_key(&other) {
                if let Some(other_kf) = self.keyframes.get_mut(&other) {
                    other_kf.erase_covisibility(kf_id);
                }
            }
        }
        for (&other, &w) in &kept {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.add_covisibility(kf_id, w);
            }
        }

        let needs_parent = Some(kf_id) != self.origin_kf_id && self.keyframes[&kf_id].is_root();
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_covisibility(kept);
        }
        if needs_parent {
            if let Some((parent, _)) = best {
                self.set_parent(kf_id, parent);
            }
        }
    }

    /// Attach `child` below `parent` in the spanning tree.
    pub fn set_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) {
        if child == parent || !self.keyframes.contains_key(&parent) {
            return;
        }
        let old_parent = match self.keyframes.get_mut(&child) {
            Some(kf) => {
                let old = kf.parent_id;
                kf.set_parent(parent);
                old
            }
            None => return,
        };
        if let Some(old) = old_parent {
            if let Some(old_kf) = self.keyframes.get_mut(&old) {
                old_kf.erase_child(child);
            }
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.add_child(child);
        }
    }

    /// Record a loop edge in both KeyFrames.
    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.add_loop_edge(b);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.add_loop_edge(a);
        }
    }

    /// Covisible KeyFrames of `kf_id` (not including itself).
    pub fn connected_keyframes(&self, kf_id: KeyFrameId) -> HashSet<KeyFrameId> {
        self.keyframes
            .get(&kf_id)
            .map(|kf| kf.covisibility_weights().keys().copied().collect())
            .unwrap_or_default()
    }

    /// All MapPoints observed by a set of KeyFrames, without duplicates and in
    /// first-seen order.
    pub fn get_map_points_from_keyframes(&self, kf_ids: &[KeyFrameId]) -> Vec<MapPointId> {
        let mut seen = HashSet::new();
        let mut points = Vec::new();
        for kf_id in kf_ids {
            if let Some(kf) = self.keyframes.get(kf_id) {
                for (_, mp_id) in kf.get_map_point_indices() {
                    if seen.insert(mp_id) {
                        points.push(mp_id);
                    }
                }
            }
        }
        points
    }

    /// Pick as representative descriptor the observation with the least
    /// median distance to all other observations.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let descriptors: Vec<Descriptor> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .iter()
                .filter_map(|(kf_id, &idx)| {
                    self.keyframes.get(kf_id).and_then(|kf| kf.descriptors.get(idx).copied())
                })
                .collect(),
            None => return,
        };
        if descriptors.is_empty() {
            return;
        }

        let n = descriptors.len();
        let mut best_median = u32::MAX;
        let mut best_idx = 0;
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| descriptor_distance(&descriptors[i], &descriptors[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = descriptors[best_idx];
        }
    }

    /// Update the normal and depth bounds for a MapPoint from its observers.
    pub fn update_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let centers: Vec<Vector3<f64>> = mp
            .observations
            .keys()
            .filter_map(|kf_id| self.keyframes.get(kf_id).map(|kf| kf.camera_center()))
            .collect();

        let reference = self
            .keyframes
            .get(&mp.ref_kf_id)
            .filter(|kf| mp.is_observed_by(kf.id))
            .or_else(|| {
                mp.observations
                    .keys()
                    .min()
                    .and_then(|kf_id| self.keyframes.get(kf_id))
            });
        let Some(reference) = reference else {
            return;
        };
        let level = mp
            .observations
            .get(&reference.id)
            .and_then(|&idx| reference.keypoints.get(idx))
            .map_or(0, |kp| kp.octave);
        let ref_center = reference.camera_center();
        let ref_level_scale = reference.pyramid.scale(level);
        let max_level_scale = reference.pyramid.scale(reference.pyramid.num_levels - 1);

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(
                centers.into_iter(),
                &ref_center,
                ref_level_scale,
                max_level_scale,
            );
        }
    }

    pub fn landmark_snapshot(&self, mp_id: MapPointId) -> Option<LandmarkSnapshot> {
        let mp = self.map_points.get(&mp_id)?;
        if mp.is_bad {
            return None;
        }
        Some(LandmarkSnapshot {
            id: mp.id,
            position: mp.position,
            descriptor: mp.descriptor,
            normal: mp.normal,
            min_distance: mp.min_distance,
            max_distance: mp.max_distance,
        })
    }

    /// Detached copy of a KeyFrame and its landmarks.
    pub fn snapshot_keyframe(&self, kf_id: KeyFrameId) -> Option<KeyFrameSnapshot> {
        let kf = self.keyframes.get(&kf_id)?;
        let landmarks = kf
            .map_point_ids
            .iter()
            .map(|mp| mp.and_then(|id| self.landmark_snapshot(id)))
            .collect();
        Some(KeyFrameSnapshot {
            id: kf.id,
            timestamp_ns: kf.timestamp_ns,
            pose: kf.pose,
            camera: kf.camera,
            pyramid: Arc::clone(&kf.pyramid),
            keypoints: kf.keypoints.clone(),
            descriptors: kf.descriptors.clone(),
            bow_vector: kf.bow_vector.clone().unwrap_or_default(),
            feature_vector: kf.feature_vector.clone().unwrap_or_default(),
            landmarks,
        })
    }

    /// Clear the entire map.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.replacements.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
        self.origin_kf_id = None;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("num_replaced", &self.replacements.len())
            .finish()
    }
}
