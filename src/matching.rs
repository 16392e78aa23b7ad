//! ORB feature matching between keyframes for loop verification and fusion.
//!
//! Every search works on [`KeyFrameSnapshot`]s so it can run without holding
//! the map lock, and on snapshots of remote keyframes that never enter the map.
//! Searches only compute correspondences; applying them to the map is left to
//! the caller.

use std::collections::HashSet;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::atlas::map::{
    descriptor_distance, Descriptor, KeyFrameSnapshot, LandmarkSnapshot, MapPointId,
};
use crate::geometry::{Sim3, SE3};

/// Max descriptor distance for acceptance.
pub const TH_HIGH: u32 = 100;
/// Stricter threshold.
pub const TH_LOW: u32 = 50;

const HISTO_LENGTH: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Best/second-best ratio test used by `search_by_bow`.
    pub nn_ratio: f64,
    /// Reject matches whose keypoint rotation disagrees with the dominant one.
    pub check_orientation: bool,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            nn_ratio: 0.75,
            check_orientation: true,
        }
    }
}

/// A correspondence produced by [`fuse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseAction {
    /// The feature already has a landmark that duplicates `loop_point`.
    Replace {
        feature_idx: usize,
        existing: MapPointId,
        loop_point: MapPointId,
    },
    /// The feature has no landmark yet and should observe `loop_point`.
    Add {
        feature_idx: usize,
        loop_point: MapPointId,
    },
}

/// Histogram of keypoint orientation differences, used to keep only the
/// matches agreeing with the three dominant rotations.
struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    fn add(&mut self, angle1: f64, angle2: f64, idx: usize) {
        let mut rot = angle1 - angle2;
        if rot < 0.0 {
            rot += 360.0;
        }
        let mut bin = (rot / HISTO_LENGTH as f64).round() as usize;
        if bin >= HISTO_LENGTH {
            bin = 0;
        }
        self.bins[bin].push(idx);
    }

    /// Indices falling outside the dominant bins.
    fn outliers(&self) -> Vec<usize> {
        let mut sizes: Vec<(usize, usize)> =
            self.bins.iter().enumerate().map(|(i, b)| (b.len(), i)).collect();
        sizes.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let max1 = sizes[0].0;
        let mut keep = vec![sizes[0].1];
        for &(len, bin) in sizes.iter().skip(1).take(2) {
            if len > 0 && (len as f64) >= 0.1 * max1 as f64 {
                keep.push(bin);
            }
        }

        self.bins
            .iter()
            .enumerate()
            .filter(|(i, _)| !keep.contains(i))
            .flat_map(|(_, b)| b.iter().copied())
            .collect()
    }
}

/// Match features of two keyframes that fall into the same vocabulary node.
///
/// Only features that have a landmark on both sides are considered. Returns
/// `matches[i1] = Some(i2)`, one entry per feature of `kf1`.
pub fn search_by_bow(
    kf1: &KeyFrameSnapshot,
    kf2: &KeyFrameSnapshot,
    config: &MatcherConfig,
) -> Vec<Option<usize>> {
    let mut matches = vec![None; kf1.num_features()];
    let mut matched2 = vec![false; kf2.num_features()];
    let mut histogram = RotationHistogram::new();

    for (node, indices1) in &kf1.feature_vector {
        let Some(indices2) = kf2.feature_vector.get(node) else {
            continue;
        };

        for &idx1 in indices1 {
            if kf1.landmark(idx1).is_none() {
                continue;
            }
            let Some(d1) = kf1.descriptors.get(idx1) else {
                continue;
            };

            let mut best_dist1 = u32::MAX;
            let mut best_idx2 = None;
            let mut best_dist2 = u32::MAX;

            for &idx2 in indices2 {
                if matched2.get(idx2).copied().unwrap_or(true) || kf2.landmark(idx2).is_none() {
                    continue;
                }
                let dist = descriptor_distance(d1, &kf2.descriptors[idx2]);
                if dist < best_dist1 {
                    best_dist2 = best_dist1;
                    best_dist1 = dist;
                    best_idx2 = Some(idx2);
                } else if dist < best_dist2 {
                    best_dist2 = dist;
                }
            }

            if let Some(idx2) = best_idx2 {
                if best_dist1 < TH_LOW
                    && (best_dist1 as f64) < config.nn_ratio * best_dist2 as f64
                {
                    matches[idx1] = Some(idx2);
                    matched2[idx2] = true;
                    if config.check_orientation {
                        histogram.add(kf1.keypoints[idx1].angle, kf2.keypoints[idx2].angle, idx1);
                    }
                }
            }
        }
    }

    if config.check_orientation {
        for idx1 in histogram.outliers() {
            matches[idx1] = None;
        }
    }

    matches
}

/// Landmark projected into a camera, with the values needed to pick a
/// matching feature.
struct Projection {
    u: f64,
    v: f64,
    level: usize,
    radius: f64,
}

/// Project a camera-frame point into `kf`, checking image bounds and the
/// landmark's scale invariance range. `unit_scale` converts distances in
/// `kf`'s camera frame back into the landmark map's units.
fn project_into(
    kf: &KeyFrameSnapshot,
    landmark: &LandmarkSnapshot,
    p_cam: &Vector3<f64>,
    unit_scale: f64,
    th: f64,
) -> Option<Projection> {
    let uv = kf.camera.project(p_cam)?;
    if !kf.camera.is_in_image(&uv) {
        return None;
    }
    let dist = p_cam.norm() * unit_scale;
    if !landmark.is_in_distance_range(dist) {
        return None;
    }
    let level = kf.pyramid.predict_scale(dist, landmark.max_distance);
    Some(Projection {
        u: uv.x,
        v: uv.y,
        level,
        radius: th * kf.pyramid.scale(level),
    })
}

/// Best feature of `kf` in the projection window whose octave lies in
/// [level - 1, level], skipping features rejected by `skip`.
fn best_in_window(
    kf: &KeyFrameSnapshot,
    proj: &Projection,
    descriptor: &Descriptor,
    skip: impl Fn(usize) -> bool,
) -> Option<(usize, u32)> {
    let min_level = proj.level.saturating_sub(1);
    kf.features_in_area(proj.u, proj.v, proj.radius, Some(min_level), Some(proj.level))
        .into_iter()
        .filter(|&idx| !skip(idx))
        .map(|idx| (idx, descriptor_distance(descriptor, &kf.descriptors[idx])))
        .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}

/// Search new matches by projecting the landmarks of each keyframe into the
/// other through the similarity `s12` (camera 2 → camera 1), keeping only
/// mutually consistent matches. Existing entries of `matches12` are kept.
///
/// Returns the number of new matches.
pub fn search_by_sim3(
    kf1: &KeyFrameSnapshot,
    kf2: &KeyFrameSnapshot,
    matches12: &mut [Option<usize>],
    s12: &Sim3,
    th: f64,
) -> usize {
    let t1w = kf1.pose_cw();
    let t2w = kf2.pose_cw();
    let s21 = s12.inverse();

    let mut matched1 = vec![false; kf1.num_features()];
    let mut matched2 = vec![false; kf2.num_features()];
    for (i1, m) in matches12.iter().enumerate() {
        if let Some(i2) = *m {
            matched1[i1] = true;
            if let Some(slot) = matched2.get_mut(i2) {
                *slot = true;
            }
        }
    }

    // KF1 landmarks into KF2
    let mut match1 = vec![None; kf1.num_features()];
    for (i1, lm) in kf1.landmarks.iter().enumerate() {
        let Some(lm) = lm else { continue };
        if matched1[i1] {
            continue;
        }
        let p_c2 = s21.transform_point(&t1w.transform_point(&lm.position));
        let Some(proj) = project_into(kf2, lm, &p_c2, s12.scale, th) else {
            continue;
        };
        if let Some((idx, dist)) = best_in_window(kf2, &proj, &lm.descriptor, |_| false) {
            if dist <= TH_HIGH {
                match1[i1] = Some(idx);
            }
        }
    }

    // KF2 landmarks into KF1
    let mut match2 = vec![None; kf2.num_features()];
    for (i2, lm) in kf2.landmarks.iter().enumerate() {
        let Some(lm) = lm else { continue };
        if matched2[i2] {
            continue;
        }
        let p_c1 = s12.transform_point(&t2w.transform_point(&lm.position));
        let Some(proj) = project_into(kf1, lm, &p_c1, s21.scale, th) else {
            continue;
        };
        if let Some((idx, dist)) = best_in_window(kf1, &proj, &lm.descriptor, |_| false) {
            if dist <= TH_HIGH {
                match2[i2] = Some(idx);
            }
        }
    }

    let mut found = 0;
    for i1 in 0..kf1.num_features() {
        let Some(i2) = match1[i1] else { continue };
        if match2.get(i2).copied().flatten() == Some(i1) && kf2.landmark(i2).is_some() {
            matches12[i1] = Some(i2);
            found += 1;
        }
    }
    found
}

/// Rigid world → camera transform from a similarity world → camera, with the
/// translation expressed in the world's units.
fn rigid_from_scw(scw: &Sim3) -> SE3 {
    SE3 {
        rotation: scw.rotation,
        translation: scw.translation / scw.scale,
    }
}

/// Shared projection test of `search_by_projection` and `fuse`: landmark in
/// front, inside the image and scale range, and seen within 60° of its mean
/// viewing direction.
fn project_world_landmark(
    kf: &KeyFrameSnapshot,
    tcw: &SE3,
    camera_center: &Vector3<f64>,
    landmark: &LandmarkSnapshot,
    th: f64,
) -> Option<Projection> {
    let p_cam = tcw.transform_point(&landmark.position);
    let proj = project_into(kf, landmark, &p_cam, 1.0, th)?;
    let po = landmark.position - camera_center;
    if landmark.normal.norm() > 0.0 && po.dot(&landmark.normal) < 0.5 * po.norm() {
        return None;
    }
    Some(proj)
}

/// Project `points` into `kf` under the corrected pose `scw` and match the
/// features still unmatched in `matched`. Returns the number of new matches.
pub fn search_by_projection(
    kf: &KeyFrameSnapshot,
    scw: &Sim3,
    points: &[LandmarkSnapshot],
    matched: &mut [Option<MapPointId>],
    th: f64,
) -> usize {
    let tcw = rigid_from_scw(scw);
    let center = tcw.inverse().translation;
    let already: HashSet<MapPointId> = matched.iter().flatten().copied().collect();

    let mut found = 0;
    for lm in points {
        if already.contains(&lm.id) {
            continue;
        }
        let Some(proj) = project_world_landmark(kf, &tcw, &center, lm, th) else {
            continue;
        };
        let best = best_in_window(kf, &proj, &lm.descriptor, |idx| {
            matched.get(idx).map_or(true, |m| m.is_some())
        });
        if let Some((idx, dist)) = best {
            if dist <= TH_LOW {
                matched[idx] = Some(lm.id);
                found += 1;
            }
        }
    }
    found
}

/// Project `points` into `kf` under the corrected pose `scw` and report, per
/// matched feature, whether the loop landmark duplicates the feature's own
/// landmark or should simply be added to it. Points already observed by `kf`
/// are skipped, so applying the result and fusing again finds nothing new.
pub fn fuse(
    kf: &KeyFrameSnapshot,
    scw: &Sim3,
    points: &[LandmarkSnapshot],
    th: f64,
) -> Vec<FuseAction> {
    let tcw = rigid_from_scw(scw);
    let center = tcw.inverse().translation;
    let already: HashSet<MapPointId> =
        kf.landmarks.iter().flatten().map(|lm| lm.id).collect();
    let incoming: HashSet<MapPointId> = points.iter().map(|lm| lm.id).collect();

    // Features already holding one of `points` are settled.
    let mut claimed: Vec<bool> = kf
        .landmarks
        .iter()
        .map(|lm| lm.as_ref().is_some_and(|lm| incoming.contains(&lm.id)))
        .collect();
    let mut actions = Vec::new();
    for lm in points {
        if already.contains(&lm.id) {
            continue;
        }
        let Some(proj) = project_world_landmark(kf, &tcw, &center, lm, th) else {
            continue;
        };
        let Some((idx, dist)) = best_in_window(kf, &proj, &lm.descriptor, |idx| claimed[idx])
        else {
            continue;
        };
        if dist > TH_LOW {
            continue;
        }
        claimed[idx] = true;
        actions.push(match kf.landmark(idx) {
            Some(existing) => FuseAction::Replace {
                feature_idx: idx,
                existing: existing.id,
                loop_point: lm.id,
            },
            None => FuseAction::Add {
                feature_idx: idx,
                loop_point: lm.id,
            },
        });
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::atlas::map::{KeyFrameId, KeyPoint};
    use crate::geometry::{CameraModel, ScalePyramid};
    use crate::vocabulary::{BowVector, FeatureVector};

    fn descriptor(seed: u8) -> [u8; 32] {
        let mut d = [0u8; 32];
        for (i, b) in d.iter_mut().enumerate() {
            *b = seed.wrapping_mul(37).wrapping_add((i as u8).wrapping_mul(seed | 1));
        }
        d
    }

    /// Landmark first seen at level 0 from the origin.
    fn landmark(id: u64, position: Vector3<f64>) -> LandmarkSnapshot {
        let max_distance = position.norm();
        LandmarkSnapshot {
            id: MapPointId::new(id),
            position,
            descriptor: descriptor(id as u8),
            normal: position.normalize(),
            min_distance: max_distance / ScalePyramid::default().scale(7),
            max_distance,
        }
    }

    /// A keyframe at `pose` (T_wc) that observes every point in `points`.
    fn snapshot(id: u64, pose: SE3, points: &[LandmarkSnapshot], with_landmarks: bool) -> KeyFrameSnapshot {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0);
        let tcw = pose.inverse();
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut landmarks = Vec::new();
        let mut fv = FeatureVector::new();
        for (i, lm) in points.iter().enumerate() {
            let uv = camera.project(&tcw.transform_point(&lm.position)).unwrap();
            keypoints.push(KeyPoint::new(uv.x, uv.y, 0));
            descriptors.push(lm.descriptor);
            landmarks.push(with_landmarks.then(|| lm.clone()));
            fv.entry(i as u32 % 4).or_default().push(i);
        }
        KeyFrameSnapshot {
            id: KeyFrameId::new(id),
            timestamp_ns: 0,
            pose,
            camera,
            pyramid: Arc::new(ScalePyramid::default()),
            keypoints,
            descriptors,
            bow_vector: BowVector::new(),
            feature_vector: fv,
            landmarks,
        }
    }

    fn grid_points(offset: u64) -> Vec<LandmarkSnapshot> {
        (0..24)
            .map(|i| {
                let x = (i % 6) as f64 - 2.5;
                let y = (i / 6) as f64 - 1.5;
                landmark(offset + i, Vector3::new(x, y, 8.0 + (i % 3) as f64))
            })
            .collect()
    }

    #[test]
    fn test_search_by_bow_matches_same_landmarks() {
        let points = grid_points(1);
        let kf1 = snapshot(1, SE3::identity(), &points, true);
        let pose2 = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(0.3, 0.0, 0.0));
        let kf2 = snapshot(2, pose2, &points, true);

        let matches = search_by_bow(&kf1, &kf2, &MatcherConfig::default());
        let n = matches.iter().flatten().count();
        assert_eq!(n, points.len());
        for (i, m) in matches.iter().enumerate() {
            assert_eq!(*m, Some(i));
        }
    }

    #[test]
    fn test_search_by_bow_requires_landmarks() {
        let points = grid_points(1);
        let kf1 = snapshot(1, SE3::identity(), &points, true);
        let kf2 = snapshot(2, SE3::identity(), &points, false);
        let matches = search_by_bow(&kf1, &kf2, &MatcherConfig::default());
        assert!(matches.iter().all(|m| m.is_none()));
    }

    #[test]
    fn test_search_by_sim3_fills_missing_matches() {
        let points = grid_points(1);
        let kf1 = snapshot(1, SE3::identity(), &points, true);
        let pose2 = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(0.2, 0.1, 0.0));
        let kf2 = snapshot(2, pose2, &points, true);

        // S12 maps camera 2 coordinates into camera 1: p1 = T1w * T2w^-1 * p2
        let s12 = Sim3::from_se3(&kf1.pose_cw().compose(&kf2.pose));
        let mut matches12: Vec<Option<usize>> = vec![None; points.len()];
        matches12[0] = Some(0);

        let found = search_by_sim3(&kf1, &kf2, &mut matches12, &s12, 7.5);
        assert_eq!(found, points.len() - 1);
        for (i, m) in matches12.iter().enumerate() {
            assert_eq!(*m, Some(i));
        }
    }

    #[test]
    fn test_search_by_projection_skips_matched() {
        let points = grid_points(1);
        let kf = snapshot(1, SE3::identity(), &points, false);
        let scw = Sim3::from_se3(&kf.pose_cw());

        let mut matched: Vec<Option<MapPointId>> = vec![None; points.len()];
        matched[3] = Some(points[3].id);
        let found = search_by_projection(&kf, &scw, &points, &mut matched, 10.0);
        assert_eq!(found, points.len() - 1);
        assert!(matched.iter().all(|m| m.is_some()));
    }

    #[test]
    fn test_fuse_reports_replace_and_add() {
        let points = grid_points(1);
        let mut kf = snapshot(1, SE3::identity(), &points, true);
        // Feature 5 has no landmark; feature 0 holds a duplicate of point 0.
        kf.landmarks[5] = None;
        let mut duplicate = points[0].clone();
        duplicate.id = MapPointId::new(999);
        kf.landmarks[0] = Some(duplicate);

        let scw = Sim3::from_se3(&kf.pose_cw());
        let actions = fuse(&kf, &scw, &points, 4.0);
        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&FuseAction::Replace {
            feature_idx: 0,
            existing: MapPointId::new(999),
            loop_point: points[0].id,
        }));
        assert!(actions.contains(&FuseAction::Add {
            feature_idx: 5,
            loop_point: points[5].id,
        }));
    }

    #[test]
    fn test_fuse_scaled_pose_matches_rigid() {
        let points = grid_points(1);
        let mut kf = snapshot(1, SE3::identity(), &points, false);
        kf.landmarks.iter_mut().for_each(|l| *l = None);
        // A similarity world->camera with scale 2 describes the same rigid pose.
        let scw = Sim3 {
            scale: 2.0,
            ..Sim3::from_se3(&kf.pose_cw())
        };
        let actions = fuse(&kf, &scw, &points, 4.0);
        assert_eq!(actions.len(), points.len());
    }

    #[test]
    fn test_rotation_histogram_keeps_dominant() {
        let mut hist = RotationHistogram::new();
        for i in 0..20 {
            hist.add(10.0, 10.0, i);
        }
        hist.add(200.0, 10.0, 20);
        // A single stray match is below 10% of the dominant bin.
        assert_eq!(hist.outliers(), vec![20]);
    }
}
