//! Loop correction: Sim3 propagation, map point fusion and graph update.
//!
//! Runs with exclusive access to the map. The steps are:
//! 1. PROPAGATE: corrected Sim3 pose for the current keyframe and its
//!    covisibles, and their landmarks moved along
//! 2. FUSE: merge the matched loop landmarks into the current keyframe and
//!    project the loop neighbourhood into every corrected keyframe
//! 3. GRAPH: record the new loop connections, optimize the Essential Graph
//!    and add the loop edge

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::atlas::map::{KeyFrameId, LandmarkSnapshot, Map, MapPointId};
use crate::error::{LoopClosingError, Result};
use crate::geometry::Sim3;
use crate::matching::{fuse, FuseAction};
use crate::optimizer::{
    optimize_essential_graph, EssentialGraphConfig, KeyFrameAndPose, LoopCorrectionInput,
};

use super::verifier::AcceptedLoop;

/// Configuration for loop correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectorConfig {
    /// Search radius (pixels at level 0) when fusing loop landmarks.
    pub fuse_radius: f64,
    /// Optimize the Essential Graph after fusion.
    pub optimize_essential_graph: bool,
    /// Launch Global BA once the correction is committed.
    pub run_global_ba: bool,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            fuse_radius: 4.0,
            optimize_essential_graph: true,
            run_global_ba: true,
        }
    }
}

/// Summary of one committed correction.
#[derive(Debug, Clone)]
pub struct CorrectionOutcome {
    pub current_kf: KeyFrameId,
    pub loop_kf: KeyFrameId,
    /// Corrected poses (camera to world) of the current neighbourhood.
    pub corrected_poses: KeyFrameAndPose,
    pub corrected_points: usize,
    pub fused_points: usize,
    pub loop_connections: HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    pub essential_graph_optimized: bool,
}

#[derive(Debug, Clone)]
pub struct LoopCorrector {
    config: CorrectorConfig,
    essential_graph: EssentialGraphConfig,
    fix_scale: bool,
}

impl LoopCorrector {
    pub fn new(config: CorrectorConfig, essential_graph: EssentialGraphConfig, fix_scale: bool) -> Self {
        Self {
            config,
            essential_graph,
            fix_scale,
        }
    }

    pub fn config(&self) -> &CorrectorConfig {
        &self.config
    }

    /// Apply an accepted loop to `map`.
    ///
    /// The caller must hold the map exclusively and keep mapping paused.
    pub fn correct(&self, map: &mut Map, accepted: AcceptedLoop) -> Result<CorrectionOutcome> {
        let current = accepted.current_kf;
        if map.get_keyframe(current).is_none() {
            return Err(LoopClosingError::UnknownKeyFrame(current));
        }
        if map.get_keyframe(accepted.loop_kf).is_none() {
            return Err(LoopClosingError::UnknownKeyFrame(accepted.loop_kf));
        }

        map.update_connections(current);

        let mut current_group: Vec<KeyFrameId> = map
            .get_keyframe(current)
            .map(|kf| kf.ordered_covisibles().into_iter().map(|(id, _)| id).collect())
            .unwrap_or_default();
        current_group.insert(0, current);
        let group_set: HashSet<KeyFrameId> = current_group.iter().copied().collect();

        // 1. PROPAGATE
        let (corrected, non_corrected) =
            propagate_correction(map, current, &accepted.scw, &current_group);
        let corrected_points = correct_neighbourhood(map, &corrected, &non_corrected, &current_group);

        let previous_neighbours: HashMap<KeyFrameId, HashSet<KeyFrameId>> = current_group
            .iter()
            .map(|&id| (id, map.connected_keyframes(id)))
            .collect();

        // 2. FUSE
        let mut fused = fuse_current_matches(map, current, &accepted.current_matched_points);
        fused += search_and_fuse(map, &corrected, &accepted.loop_map_points, self.config.fuse_radius);

        // 3. GRAPH
        let mut loop_connections = HashMap::new();
        for &kf_id in &current_group {
            map.update_connections(kf_id);
            let previous = previous_neighbours.get(&kf_id);
            let new_links: HashSet<KeyFrameId> = map
                .connected_keyframes(kf_id)
                .into_iter()
                .filter(|id| !group_set.contains(id))
                .filter(|id| previous.map_or(true, |p| !p.contains(id)))
                .collect();
            loop_connections.insert(kf_id, new_links);
        }

        let mut essential_graph_optimized = false;
        if self.config.optimize_essential_graph {
            let input = LoopCorrectionInput {
                loop_kf: accepted.loop_kf,
                current_kf: current,
                non_corrected: &non_corrected,
                corrected: &corrected,
                loop_connections: &loop_connections,
                corrected_points: &corrected_points,
                fix_scale: self.fix_scale,
            };
            essential_graph_optimized =
                optimize_essential_graph(map, &input, &self.essential_graph).is_some();
        }

        map.add_loop_edge(current, accepted.loop_kf);

        tracing::debug!(
            current = %current,
            loop_kf = %accepted.loop_kf,
            keyframes = corrected.len(),
            points = corrected_points.len(),
            fused,
            "loop corrected"
        );

        Ok(CorrectionOutcome {
            current_kf: current,
            loop_kf: accepted.loop_kf,
            corrected_poses: corrected,
            corrected_points: corrected_points.len(),
            fused_points: fused,
            loop_connections,
            essential_graph_optimized,
        })
    }
}

/// Corrected and original camera-to-world poses of `group`.
///
/// The current keyframe takes `scw^-1`; every other member keeps its pose
/// relative to the current keyframe: `S_wi = S_wc * T_cw * T_wi`.
pub fn propagate_correction(
    map: &Map,
    current: KeyFrameId,
    scw: &Sim3,
    group: &[KeyFrameId],
) -> (KeyFrameAndPose, KeyFrameAndPose) {
    let s_wc = scw.inverse();
    let mut corrected = KeyFrameAndPose::new();
    let mut non_corrected = KeyFrameAndPose::new();

    let Some(t_wc) = map.get_keyframe(current).map(|kf| kf.pose) else {
        return (corrected, non_corrected);
    };
    let t_cw = t_wc.inverse();

    for &kf_id in group {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        let pose = if kf_id == current {
            s_wc
        } else {
            s_wc.compose(&Sim3::from_se3(&t_cw.compose(&kf.pose)))
        };
        corrected.insert(kf_id, pose);
        non_corrected.insert(kf_id, Sim3::from_se3(&kf.pose));
    }
    (corrected, non_corrected)
}

/// Move the landmarks of `group` with their first corrected observer and
/// write the corrected poses. Returns landmark → keyframe that moved it.
fn correct_neighbourhood(
    map: &mut Map,
    corrected: &KeyFrameAndPose,
    non_corrected: &KeyFrameAndPose,
    group: &[KeyFrameId],
) -> HashMap<MapPointId, KeyFrameId> {
    let mut moved: HashMap<MapPointId, KeyFrameId> = HashMap::new();
    let mut positions = Vec::new();

    for &kf_id in group {
        let (Some(s_wi), Some(before)) = (corrected.get(&kf_id), non_corrected.get(&kf_id)) else {
            continue;
        };
        let s_iw = before.inverse();
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        for (_, mp_id) in kf.get_map_point_indices() {
            if moved.contains_key(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            moved.insert(mp_id, kf_id);
            positions.push((mp_id, s_wi.transform_point(&s_iw.transform_point(&mp.position))));
        }
    }

    for (kf_id, s_wi) in corrected {
        map.set_keyframe_pose(*kf_id, s_wi.to_se3());
    }
    for (mp_id, position) in positions {
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = position;
        }
        map.update_normal_and_depth(mp_id);
    }
    moved
}

/// Merge two landmarks known to be the same 3-D point. The one with more
/// observations survives; on a tie the loop landmark does.
fn merge_duplicate(map: &mut Map, existing: MapPointId, loop_point: MapPointId) -> bool {
    let (Some(existing), Some(loop_point)) =
        (map.resolve_map_point(existing), map.resolve_map_point(loop_point))
    else {
        return false;
    };
    if existing == loop_point {
        return false;
    }
    let observations = |id| map.get_map_point(id).map_or(0, |mp| mp.num_observations());
    if observations(existing) > observations(loop_point) {
        map.replace_map_point(loop_point, existing)
    } else {
        map.replace_map_point(existing, loop_point)
    }
}

/// Attach the loop landmarks matched during verification to the current
/// keyframe, merging where the feature already has its own landmark.
fn fuse_current_matches(
    map: &mut Map,
    current: KeyFrameId,
    matched: &[Option<MapPointId>],
) -> usize {
    let mut fused = 0;
    for (feature_idx, loop_point) in matched.iter().enumerate() {
        let Some(loop_point) = loop_point.and_then(|id| map.resolve_map_point(id)) else {
            continue;
        };
        let existing = map
            .get_keyframe(current)
            .and_then(|kf| kf.get_map_point(feature_idx));
        match existing {
            Some(existing) => {
                if merge_duplicate(map, existing, loop_point) {
                    fused += 1;
                }
            }
            None => {
                if map.associate(current, feature_idx, loop_point) {
                    map.compute_distinctive_descriptor(loop_point);
                }
            }
        }
    }
    fused
}

/// Project the loop landmarks into every corrected keyframe and merge the
/// duplicates found. Returns the number of merges.
///
/// Landmark ids are resolved through the map's replacement chain first, so
/// running this twice with the same poses merges nothing the second time.
pub fn search_and_fuse(
    map: &mut Map,
    corrected: &KeyFrameAndPose,
    loop_points: &[MapPointId],
    radius: f64,
) -> usize {
    let mut kf_ids: Vec<KeyFrameId> = corrected.keys().copied().collect();
    kf_ids.sort();

    let mut merges = 0;
    for kf_id in kf_ids {
        let Some(s_wi) = corrected.get(&kf_id) else {
            continue;
        };

        let mut seen = HashSet::new();
        let landmarks: Vec<LandmarkSnapshot> = loop_points
            .iter()
            .filter_map(|&id| map.resolve_map_point(id))
            .filter(|id| seen.insert(*id))
            .filter_map(|id| map.landmark_snapshot(id))
            .collect();
        let Some(snapshot) = map.snapshot_keyframe(kf_id) else {
            continue;
        };

        for action in fuse(&snapshot, &s_wi.inverse(), &landmarks, radius) {
            match action {
                FuseAction::Replace {
                    existing,
                    loop_point,
                    ..
                } => {
                    if merge_duplicate(map, existing, loop_point) {
                        merges += 1;
                    }
                }
                FuseAction::Add {
                    feature_idx,
                    loop_point,
                } => {
                    if let Some(loop_point) = map.resolve_map_point(loop_point) {
                        map.associate(kf_id, feature_idx, loop_point);
                    }
                }
            }
        }
    }
    merges
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};
    use std::sync::Arc;

    use crate::atlas::map::KeyPoint;
    use crate::geometry::{CameraModel, ScalePyramid, SE3};

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0)
    }

    fn descriptor(i: usize) -> [u8; 32] {
        let mut d = [0u8; 32];
        for (k, b) in d.iter_mut().enumerate() {
            *b = ((i * 37 + k * 11) % 251) as u8 ^ ((i * 13) as u8);
        }
        d
    }

    fn pose_at(x: f64) -> SE3 {
        SE3::new(UnitQuaternion::identity(), Vector3::new(x, 0.0, 0.0))
    }

    /// Keyframe at `pose` seeing every point of `world`; feature i looks at
    /// point i.
    fn add_keyframe(map: &mut Map, pose: SE3, world: &[Vector3<f64>]) -> KeyFrameId {
        let cam = camera();
        let tcw = pose.inverse();
        let keypoints = world
            .iter()
            .map(|p| {
                let uv = cam.project(&tcw.transform_point(p)).unwrap();
                KeyPoint::new(uv.x, uv.y, 0)
            })
            .collect();
        let descriptors = (0..world.len()).map(descriptor).collect();
        map.create_keyframe(0, pose, cam, Arc::new(ScalePyramid::default()), keypoints, descriptors)
    }

    fn world(n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| {
                let f = i as f64;
                Vector3::new(-2.0 + (f % 5.0), -1.5 + (f / 5.0).floor() * 0.7, 7.0 + (f * 0.3).sin())
            })
            .collect()
    }

    /// Two keyframes of the same scene, each with its own landmarks.
    fn duplicated_scene() -> (Map, KeyFrameId, KeyFrameId, Vec<MapPointId>, Vec<MapPointId>) {
        let mut map = Map::new();
        let points = world(20);
        let kf_a = add_keyframe(&mut map, pose_at(0.0), &points);
        let kf_b = add_keyframe(&mut map, pose_at(0.0), &points);

        let mut ids_a = Vec::new();
        let mut ids_b = Vec::new();
        for (i, p) in points.iter().enumerate() {
            let a = map.create_map_point(*p, descriptor(i), kf_a);
            map.associate(kf_a, i, a);
            map.update_normal_and_depth(a);
            ids_a.push(a);

            let b = map.create_map_point(*p, descriptor(i), kf_b);
            map.associate(kf_b, i, b);
            map.update_normal_and_depth(b);
            ids_b.push(b);
        }
        (map, kf_a, kf_b, ids_a, ids_b)
    }

    #[test]
    fn test_propagation_keeps_relative_poses() {
        let mut map = Map::new();
        let points = world(5);
        let current = add_keyframe(&mut map, pose_at(0.0), &points);
        let neighbour = add_keyframe(&mut map, pose_at(1.0), &points);

        // Shift the current keyframe by 2 along x.
        let scw = Sim3::from_se3(&pose_at(2.0).inverse());
        let (corrected, non_corrected) =
            propagate_correction(&map, current, &scw, &[current, neighbour]);

        assert_relative_eq!(corrected[&current].translation, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(corrected[&neighbour].translation, Vector3::new(3.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(non_corrected[&neighbour].translation, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_search_and_fuse_merges_duplicates_once() {
        let (mut map, kf_a, kf_b, ids_a, _) = duplicated_scene();
        let mut corrected = KeyFrameAndPose::new();
        corrected.insert(kf_b, Sim3::from_se3(&pose_at(0.0)));

        let first = search_and_fuse(&mut map, &corrected, &ids_a, 4.0);
        assert_eq!(first, ids_a.len());

        let second = search_and_fuse(&mut map, &corrected, &ids_a, 4.0);
        assert_eq!(second, 0);

        // Both keyframes now see the same landmark through every feature.
        let a = map.get_keyframe(kf_a).unwrap();
        let b = map.get_keyframe(kf_b).unwrap();
        for i in 0..ids_a.len() {
            assert_eq!(a.get_map_point(i), b.get_map_point(i));
        }
        assert_eq!(map.num_map_points(), ids_a.len());
    }

    #[test]
    fn test_merge_keeps_better_observed_point() {
        let (mut map, kf_a, kf_b, ids_a, ids_b) = duplicated_scene();
        let points = world(20);
        let kf_c = add_keyframe(&mut map, pose_at(0.0), &points);
        map.associate(kf_c, 0, ids_b[0]);

        assert!(merge_duplicate(&mut map, ids_b[0], ids_a[0]));
        // ids_b[0] had two observers against one.
        assert_eq!(map.resolve_map_point(ids_a[0]), Some(ids_b[0]));
        assert_eq!(map.get_keyframe(kf_a).unwrap().get_map_point(0), Some(ids_b[0]));
        assert_eq!(map.get_keyframe(kf_b).unwrap().get_map_point(0), Some(ids_b[0]));
    }

    #[test]
    fn test_correct_rejects_unknown_keyframe() {
        let mut map = Map::new();
        let corrector = LoopCorrector::new(CorrectorConfig::default(), EssentialGraphConfig::default(), false);
        let accepted = AcceptedLoop {
            current_kf: KeyFrameId::new(5),
            loop_kf: KeyFrameId::new(1),
            s12: Sim3::identity(),
            scw: Sim3::identity(),
            current_matched_points: Vec::new(),
            loop_map_points: Vec::new(),
            num_inliers: 0,
        };
        assert!(matches!(
            corrector.correct(&mut map, accepted),
            Err(LoopClosingError::UnknownKeyFrame(_))
        ));
    }
}
