//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the core nodes of the SLAM graph. They contain:
//! - Visual evidence (keypoints, descriptors, bag-of-words)
//! - Pose estimate (SE3 transform)
//! - Graph relationships (covisibility, spanning tree, loop edges)
//!
//! Only the loop closer and the global refinement worker rewrite a keyframe's
//! pose once it is in the map; everything else about it is fixed at creation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nalgebra::Vector3;

use crate::geometry::{CameraModel, ScalePyramid, SE3};
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{Descriptor, KeyFrameId, KeyPoint, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,

    /// ORB descriptors, one per keypoint.
    pub descriptors: Vec<Descriptor>,

    /// Bag-of-Words representation used for place recognition.
    pub bow_vector: Option<BowVector>,

    /// Feature indices grouped by vocabulary node, used to restrict matching
    /// to features that fall into the same node.
    pub feature_vector: Option<FeatureVector>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    // ─────────────────────────────────────────────────────────────────────────
    // Essential Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Parent KeyFrame in the spanning tree. None for the root.
    pub parent_id: Option<KeyFrameId>,

    pub children_ids: HashSet<KeyFrameId>,

    /// KeyFrames this one was loop-closed against.
    loop_edges: HashSet<KeyFrameId>,

    pub is_bad: bool,
}

impl KeyFrame {
    /// Create a new KeyFrame.
    ///
    /// # Arguments
    /// * `id` - Unique identifier
    /// * `timestamp_ns` - Timestamp in nanoseconds
    /// * `pose` - Camera-to-world transform (T_wc)
    /// * `camera` - Intrinsics of the camera that took the image
    /// * `pyramid` - ORB scale pyramid used by the extractor
    /// * `keypoints` - Detected feature keypoints
    /// * `descriptors` - ORB descriptors (same length as `keypoints`)
    pub fn new(
        id: KeyFrameId,
        timestamp_ns: u64,
        pose: SE3,
        camera: CameraModel,
        pyramid: Arc<ScalePyramid>,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
    ) -> Self {
        let num_features = keypoints.len();
        Self {
            id,
            timestamp_ns,
            pose,
            camera,
            pyramid,
            keypoints,
            descriptors,
            bow_vector: None,
            feature_vector: None,
            map_point_ids: vec![None; num_features],
            covisibility_weights: HashMap::new(),
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            is_bad: false,
        }
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    /// World-to-camera transform (T_cw).
    pub fn pose_cw(&self) -> SE3 {
        self.pose.inverse()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bag-of-Words accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_bow(&mut self, bow: BowVector, feature_vector: FeatureVector) {
        self.bow_vector = Some(bow);
        self.feature_vector = Some(feature_vector);
    }

    pub fn bow_vector(&self) -> Option<&BowVector> {
        self.bow_vector.as_ref()
    }

    pub fn feature_vector(&self) -> Option<&FeatureVector> {
        self.feature_vector.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a MapPoint.
    ///
    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// All associated MapPoint IDs with their feature indices.
    pub fn get_map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection. Self-connections are ignored.
    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        self.covisibility_weights.remove(&kf_id);
    }

    /// Replace all covisibility connections at once.
    pub fn set_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// Covisible KeyFrames sorted by weight, best first. Ties break on id so
    /// the order is deterministic.
    pub fn ordered_covisibles(&self) -> Vec<(KeyFrameId, usize)> {
        let mut ordered: Vec<(KeyFrameId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered
    }

    /// The N best covisible KeyFrames (most shared points first).
    pub fn get_best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles()
            .into_iter()
            .take(n)
            .map(|(id, _)| id)
            .collect()
    }

    /// Covisible KeyFrames with at least `min_weight` shared points.
    pub fn get_covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles()
            .into_iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| id)
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Loop Edges
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn add_loop_edge(&mut self, kf_id: KeyFrameId) {
        if kf_id != self.id {
            self.loop_edges.insert(kf_id);
        }
    }

    pub fn loop_edges(&self) -> &HashSet<KeyFrameId> {
        &self.loop_edges
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    pub fn num_features(&self) -> usize {
        self.keypoints.len()
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("has_parent", &self.parent_id.is_some())
            .field("num_children", &self.children_ids.len())
            .field("loop_edges", &self.loop_edges.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_keyframe_with_features(id: u64, num_features: usize) -> KeyFrame {
        KeyFrame::new(
            KeyFrameId::new(id),
            1_000_000 * id,
            SE3::identity(),
            CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0),
            Arc::new(ScalePyramid::default()),
            vec![KeyPoint::new(10.0, 10.0, 0); num_features],
            vec![[0u8; 32]; num_features],
        )
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_keyframe_with_features(1, 10);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.get_map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        let erased = kf.erase_map_point(3);
        assert_eq!(erased, Some(MapPointId::new(200)));
        assert_eq!(kf.get_map_point(3), None);

        // Out of range indices are ignored.
        assert_eq!(kf.set_map_point(42, MapPointId::new(1)), None);
        assert_eq!(kf.num_map_points(), 0);
    }

    #[test]
    fn test_covisibility_graph() {
        let mut kf = create_keyframe_with_features(1, 0);

        kf.add_covisibility(KeyFrameId::new(2), 50);
        kf.add_covisibility(KeyFrameId::new(3), 100);
        kf.add_covisibility(KeyFrameId::new(4), 25);

        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(2)), 50);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(5)), 0);

        let best = kf.get_best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId::new(3), KeyFrameId::new(2)]);

        let above_30 = kf.get_covisibles_above_weight(30);
        assert_eq!(above_30.len(), 2);
    }

    #[test]
    fn test_covisibility_no_self_connection() {
        let mut kf = create_keyframe_with_features(1, 0);
        kf.add_covisibility(KeyFrameId::new(1), 100);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(1)), 0);

        let mut weights = HashMap::new();
        weights.insert(KeyFrameId::new(1), 7);
        weights.insert(KeyFrameId::new(2), 7);
        kf.set_covisibility(weights);
        assert_eq!(kf.covisibility_weights().len(), 1);
    }

    #[test]
    fn test_spanning_tree_and_loop_edges() {
        let mut kf1 = create_keyframe_with_features(1, 0);
        let mut kf2 = create_keyframe_with_features(2, 0);

        assert!(kf1.is_root());
        kf2.set_parent(KeyFrameId::new(1));
        kf1.add_child(KeyFrameId::new(2));
        assert!(!kf2.is_root());
        assert!(kf1.children_ids.contains(&KeyFrameId::new(2)));

        kf1.add_loop_edge(KeyFrameId::new(9));
        kf1.add_loop_edge(KeyFrameId::new(1));
        assert_eq!(kf1.loop_edges().len(), 1);
    }
}
