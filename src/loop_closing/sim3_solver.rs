//! Sim3 solver using Horn's method with RANSAC.
//!
//! Hypotheses are computed from three landmark pairs expressed in their own
//! camera frames and scored by reprojecting every pair into both images.
//! Scale is kept at 1.0 when the sensor observes metric depth.

use nalgebra::{Matrix3, Vector2, Vector3};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::atlas::map::KeyFrameSnapshot;
use crate::geometry::{CameraModel, Sim3};
use crate::optimizer::Sim3Correspondence;

/// Configuration for Sim3 RANSAC solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sim3SolverConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Minimum number of inliers required.
    pub min_inliers: usize,
    /// Probability of finding a good model.
    pub probability: f64,
    /// chi2 (2 DOF, 99%) reprojection threshold, scaled by the level sigma².
    pub chi2_threshold: f64,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 300,
            min_inliers: 20,
            probability: 0.99,
            chi2_threshold: 9.21,
        }
    }
}

/// Result from Sim3 RANSAC solver.
#[derive(Debug, Clone)]
pub struct Sim3Result {
    /// Similarity mapping camera 2 coordinates into camera 1.
    pub s12: Sim3,
    /// Inlier flag per feature of keyframe 1.
    pub inliers: Vec<bool>,
    /// Number of inliers.
    pub num_inliers: usize,
}

/// Landmark pair between two keyframes, tagged with its feature index in
/// keyframe 1.
#[derive(Debug, Clone, Copy)]
pub struct MatchedPair {
    pub feature1: usize,
    pub feature2: usize,
    pub correspondence: Sim3Correspondence,
}

/// Build camera-frame correspondences from `matches12` (`matches12[i1] =
/// Some(i2)`). Pairs where either side lacks a landmark or lies behind its
/// camera are skipped.
pub fn matched_pairs(
    kf1: &KeyFrameSnapshot,
    kf2: &KeyFrameSnapshot,
    matches12: &[Option<usize>],
) -> Vec<MatchedPair> {
    let t1w = kf1.pose_cw();
    let t2w = kf2.pose_cw();

    matches12
        .iter()
        .enumerate()
        .filter_map(|(i1, m)| {
            let i2 = (*m)?;
            let lm1 = kf1.landmark(i1)?;
            let lm2 = kf2.landmark(i2)?;
            let kp1 = kf1.keypoints.get(i1)?;
            let kp2 = kf2.keypoints.get(i2)?;

            let p1 = t1w.transform_point(&lm1.position);
            let p2 = t2w.transform_point(&lm2.position);
            if p1.z <= 0.0 || p2.z <= 0.0 {
                return None;
            }

            Some(MatchedPair {
                feature1: i1,
                feature2: i2,
                correspondence: Sim3Correspondence {
                    p1,
                    p2,
                    uv1: Vector2::new(kp1.x, kp1.y),
                    uv2: Vector2::new(kp2.x, kp2.y),
                    inv_sigma2_1: kf1.pyramid.inv_sigma2(kp1.octave),
                    inv_sigma2_2: kf2.pyramid.inv_sigma2(kp2.octave),
                },
            })
        })
        .collect()
}

/// RANSAC estimator of the similarity between two keyframes.
pub struct Sim3Solver<'a> {
    pairs: Vec<MatchedPair>,
    num_features1: usize,
    camera1: &'a CameraModel,
    camera2: &'a CameraModel,
    fix_scale: bool,
    config: Sim3SolverConfig,
}

impl<'a> Sim3Solver<'a> {
    pub fn new(
        kf1: &'a KeyFrameSnapshot,
        kf2: &'a KeyFrameSnapshot,
        matches12: &[Option<usize>],
        fix_scale: bool,
        config: &Sim3SolverConfig,
    ) -> Self {
        Self {
            pairs: matched_pairs(kf1, kf2, matches12),
            num_features1: kf1.num_features(),
            camera1: &kf1.camera,
            camera2: &kf2.camera,
            fix_scale,
            config: config.clone(),
        }
    }

    pub fn num_correspondences(&self) -> usize {
        self.pairs.len()
    }

    /// Run RANSAC. Returns `None` when no hypothesis collects
    /// `min_inliers` inliers.
    pub fn solve(&self) -> Option<Sim3Result> {
        self.solve_with_rng(&mut rand::thread_rng())
    }

    pub fn solve_with_rng(&self, rng: &mut impl Rng) -> Option<Sim3Result> {
        let n = self.pairs.len();
        if n < 3 || n < self.config.min_inliers {
            return None;
        }

        let points1: Vec<_> = self.pairs.iter().map(|p| p.correspondence.p1).collect();
        let points2: Vec<_> = self.pairs.iter().map(|p| p.correspondence.p2).collect();

        let mut best: Option<(Sim3, Vec<usize>)> = None;
        let mut max_iter = self.config.max_iterations;
        let mut iteration = 0;

        while iteration < max_iter {
            iteration += 1;
            let indices = sample_three_indices(rng, n);
            let sample1: Vec<_> = indices.iter().map(|&i| points1[i]).collect();
            let sample2: Vec<_> = indices.iter().map(|&i| points2[i]).collect();

            // Horn gives S with sample1 ≈ S * sample2, i.e. S12.
            let Some(s12) = compute_sim3_horn(&sample2, &sample1, self.fix_scale) else {
                continue;
            };

            let inliers = self.check_inliers(&s12);
            if inliers.len() > best.as_ref().map_or(0, |(_, b)| b.len()) {
                if inliers.len() >= self.config.min_inliers {
                    let ratio = inliers.len() as f64 / n as f64;
                    let adaptive = compute_adaptive_iterations(ratio, self.config.probability, 3);
                    max_iter = max_iter.min(iteration.saturating_add(adaptive));
                }
                best = Some((s12, inliers));
            }
        }

        let (mut s12, mut inliers) = best?;

        // Re-estimate from every inlier and keep it if it does not lose any.
        if inliers.len() >= self.config.min_inliers {
            let in1: Vec<_> = inliers.iter().map(|&i| points1[i]).collect();
            let in2: Vec<_> = inliers.iter().map(|&i| points2[i]).collect();
            if let Some(refined) = compute_sim3_horn(&in2, &in1, self.fix_scale) {
                let refined_inliers = self.check_inliers(&refined);
                if refined_inliers.len() >= inliers.len() {
                    s12 = refined;
                    inliers = refined_inliers;
                }
            }
        }

        if inliers.len() < self.config.min_inliers {
            return None;
        }

        let mut flags = vec![false; self.num_features1];
        for &i in &inliers {
            if let Some(flag) = flags.get_mut(self.pairs[i].feature1) {
                *flag = true;
            }
        }

        Some(Sim3Result {
            s12,
            num_inliers: inliers.len(),
            inliers: flags,
        })
    }

    /// Indices of pairs whose landmarks reproject within the level-scaled
    /// threshold in both images.
    fn check_inliers(&self, s12: &Sim3) -> Vec<usize> {
        let s21 = s12.inverse();
        self.pairs
            .iter()
            .enumerate()
            .filter(|(_, pair)| {
                let c = &pair.correspondence;
                let max_err1 = self.config.chi2_threshold / c.inv_sigma2_1;
                let max_err2 = self.config.chi2_threshold / c.inv_sigma2_2;
                let in1 = self
                    .camera1
                    .project(&s12.transform_point(&c.p2))
                    .is_some_and(|uv| (uv - c.uv1).norm_squared() < max_err1);
                let in2 = self
                    .camera2
                    .project(&s21.transform_point(&c.p1))
                    .is_some_and(|uv| (uv - c.uv2).norm_squared() < max_err2);
                in1 && in2
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// Compute Sim3 using Horn's method (closed-form solution).
///
/// Returns S such that `points2 ≈ S * points1`.
///
/// Reference: B.K.P. Horn, "Closed-form solution of absolute orientation using unit quaternions"
pub fn compute_sim3_horn(
    points1: &[Vector3<f64>],
    points2: &[Vector3<f64>],
    fix_scale: bool,
) -> Option<Sim3> {
    let n = points1.len();
    if n < 3 || n != points2.len() {
        return None;
    }

    let centroid1 = compute_centroid(points1);
    let centroid2 = compute_centroid(points2);

    let centered1: Vec<_> = points1.iter().map(|p| p - centroid1).collect();
    let centered2: Vec<_> = points2.iter().map(|p| p - centroid2).collect();

    let scale = if fix_scale {
        1.0
    } else {
        let sum_sq1: f64 = centered1.iter().map(|p| p.norm_squared()).sum();
        let sum_sq2: f64 = centered2.iter().map(|p| p.norm_squared()).sum();
        if sum_sq1 < 1e-10 {
            return None;
        }
        (sum_sq2 / sum_sq1).sqrt()
    };

    // Cross-covariance H = sum(p1_i * p2_i^T)
    let mut h = Matrix3::zeros();
    for (c1, c2) in centered1.iter().zip(&centered2) {
        h += c1 * c2.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation_mat = v_t.transpose() * u.transpose();

    // Reflection: flip the last column of V
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let translation = centroid2 - scale * (rotation_mat * centroid1);
    let sim3 = Sim3::from_rts(rotation_mat, translation, scale);
    sim3.is_valid().then_some(sim3)
}

fn compute_centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

/// Sample three unique random indices.
fn sample_three_indices(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let picked = rand::seq::index::sample(rng, n, 3);
    [picked.index(0), picked.index(1), picked.index(2)]
}

/// Compute adaptive number of RANSAC iterations.
fn compute_adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    // k = log(1 - p) / log(1 - w^n)
    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();

    if log_denom.abs() < 1e-10 {
        return 1;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    use crate::atlas::map::{KeyFrameId, KeyPoint, LandmarkSnapshot, MapPointId};
    use crate::geometry::{ScalePyramid, SE3};
    use crate::vocabulary::{BowVector, FeatureVector};

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0)
    }

    fn scene(n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| {
                let f = i as f64;
                Vector3::new((f * 0.37).sin() * 2.5, (f * 0.61).cos() * 1.5, 6.0 + (f * 0.23).sin().abs() * 3.0)
            })
            .collect()
    }

    /// A keyframe at `pose` observing `points` (world coordinates).
    fn snapshot(id: u64, pose: SE3, points: &[Vector3<f64>], map_scale: f64) -> KeyFrameSnapshot {
        let cam = camera();
        let tcw = pose.inverse();
        let mut keypoints = Vec::new();
        let mut landmarks = Vec::new();
        for (i, p) in points.iter().enumerate() {
            let uv = cam.project(&tcw.transform_point(p)).unwrap();
            keypoints.push(KeyPoint::new(uv.x, uv.y, 0));
            landmarks.push(Some(LandmarkSnapshot {
                id: MapPointId::new(i as u64),
                position: *p,
                descriptor: [0u8; 32],
                normal: Vector3::zeros(),
                min_distance: 0.1 * map_scale,
                max_distance: 100.0 * map_scale,
            }));
        }
        KeyFrameSnapshot {
            id: KeyFrameId::new(id),
            timestamp_ns: 0,
            pose,
            camera: cam,
            pyramid: Arc::new(ScalePyramid::default()),
            descriptors: vec![[0u8; 32]; keypoints.len()],
            keypoints,
            bow_vector: BowVector::new(),
            feature_vector: FeatureVector::new(),
            landmarks,
        }
    }

    #[test]
    fn test_horn_pure_translation() {
        let points1 = scene(10);
        let translation = Vector3::new(5.0, -3.0, 2.0);
        let points2: Vec<_> = points1.iter().map(|p| p + translation).collect();

        let sim3 = compute_sim3_horn(&points1, &points2, true).unwrap();

        assert_relative_eq!(sim3.scale, 1.0, epsilon = 1e-10);
        assert_relative_eq!(sim3.translation, translation, epsilon = 1e-9);
    }

    #[test]
    fn test_horn_with_scale_and_rotation() {
        let points1 = scene(12);
        let rotation = UnitQuaternion::from_euler_angles(0.1, -0.3, 0.7);
        let truth = Sim3::from_rts(*rotation.to_rotation_matrix().matrix(), Vector3::new(1.0, 0.5, -2.0), 2.5);
        let points2: Vec<_> = points1.iter().map(|p| truth.transform_point(p)).collect();

        let sim3 = compute_sim3_horn(&points1, &points2, false).unwrap();

        assert_relative_eq!(sim3.scale, 2.5, epsilon = 1e-9);
        for (p1, p2) in points1.iter().zip(&points2) {
            assert_relative_eq!(sim3.transform_point(p1), *p2, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_horn_degenerate() {
        let p = vec![Vector3::new(1.0, 1.0, 1.0); 3];
        assert!(compute_sim3_horn(&p, &p, false).is_none());
    }

    #[test]
    fn test_ransac_recovers_scaled_pair() {
        let world = scene(40);
        let kf1 = snapshot(1, SE3::identity(), &world, 1.0);

        // Same place mapped by a second map at twice the scale, shifted.
        let offset = Vector3::new(10.0, 0.0, 0.0);
        let world2: Vec<_> = world.iter().map(|p| p * 2.0 + offset).collect();
        let kf2 = snapshot(2, SE3::new(UnitQuaternion::identity(), offset), &world2, 2.0);

        let mut matches: Vec<Option<usize>> = (0..world.len()).map(Some).collect();
        // A few wrong associations
        matches.swap(0, 7);
        matches.swap(3, 11);

        let solver = Sim3Solver::new(&kf1, &kf2, &matches, false, &Sim3SolverConfig::default());
        assert_eq!(solver.num_correspondences(), 40);

        let mut rng = StdRng::seed_from_u64(7);
        let result = solver.solve_with_rng(&mut rng).unwrap();

        assert!(result.num_inliers >= 36);
        assert!(!result.inliers[0]);
        assert_relative_eq!(result.s12.scale, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_ransac_insufficient_correspondences() {
        let world = scene(10);
        let kf1 = snapshot(1, SE3::identity(), &world, 1.0);
        let kf2 = snapshot(2, SE3::identity(), &world, 1.0);
        let matches: Vec<Option<usize>> = (0..world.len()).map(Some).collect();

        let solver = Sim3Solver::new(&kf1, &kf2, &matches, true, &Sim3SolverConfig::default());
        assert!(solver.solve().is_none());
    }

    #[test]
    fn test_adaptive_iterations() {
        assert_eq!(compute_adaptive_iterations(1.0, 0.99, 3), 1);
        assert!(compute_adaptive_iterations(0.5, 0.99, 3) > compute_adaptive_iterations(0.9, 0.99, 3));
    }
}
