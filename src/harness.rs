//! Deterministic synthetic scenes for tests and the demo binary.
//!
//! A scene is a set of landmark clouds with random ORB-like descriptors. A
//! robot "observes" a cloud from a list of viewpoints: each viewpoint becomes
//! a keyframe whose features are the projections of the visible landmarks,
//! with descriptors one bit away from the landmark's. The robot's map frame
//! may differ from the scene frame by any similarity, which is how scale
//! drift and odometry drift are simulated.

use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::atlas::map::{Descriptor, KeyFrameId, KeyPoint, Map};
use crate::geometry::{CameraModel, ScalePyramid, Sim3, SE3};
use crate::vocabulary::{OrbVocabulary, VocabularyError};

/// Keypoints closer than this to the border are not observed.
const IMAGE_MARGIN: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub num_areas: usize,
    pub landmarks_per_area: usize,
    /// Distance between neighbouring area centres along x.
    pub area_spacing: f64,
    /// Uniform keypoint noise in pixels, in [-noise, noise].
    pub pixel_noise: f64,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            num_areas: 1,
            landmarks_per_area: 120,
            area_spacing: 30.0,
            pixel_noise: 0.0,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LandmarkCloud {
    pub center: Vector3<f64>,
    pub points: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
}

/// Keyframes and points one call to [`SyntheticScene::observe`] created.
#[derive(Debug, Clone)]
pub struct Observation {
    pub keyframes: Vec<KeyFrameId>,
    pub num_map_points: usize,
}

#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub camera: CameraModel,
    pub pyramid: Arc<ScalePyramid>,
    pub areas: Vec<LandmarkCloud>,
    pixel_noise: f64,
    seed: u64,
}

impl SyntheticScene {
    pub fn generate(config: &SceneConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let areas = (0..config.num_areas)
            .map(|a| {
                let center = Vector3::new(a as f64 * config.area_spacing, 0.0, 8.0);
                let points = (0..config.landmarks_per_area)
                    .map(|_| {
                        center
                            + Vector3::new(
                                rng.gen_range(-3.0..3.0),
                                rng.gen_range(-2.0..2.0),
                                rng.gen_range(-2.0..2.0),
                            )
                    })
                    .collect();
                let descriptors = (0..config.landmarks_per_area)
                    .map(|_| {
                        let mut d = [0u8; 32];
                        rng.fill(&mut d[..]);
                        d
                    })
                    .collect();
                LandmarkCloud {
                    center,
                    points,
                    descriptors,
                }
            })
            .collect();

        Self {
            camera: CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0),
            pyramid: Arc::new(ScalePyramid::default()),
            areas,
            pixel_noise: config.pixel_noise,
            seed: config.seed,
        }
    }

    /// Flat vocabulary with one word per landmark descriptor.
    pub fn vocabulary(&self) -> Result<OrbVocabulary, VocabularyError> {
        let words: Vec<Descriptor> = self
            .areas
            .iter()
            .flat_map(|area| area.descriptors.iter().copied())
            .collect();
        OrbVocabulary::from_words(&words)
    }

    /// `count` camera poses (T_wc) in a row facing the cloud of `area`, with
    /// the row shifted sideways by `lateral_offset`.
    pub fn viewpoints(&self, area: usize, count: usize, lateral_offset: f64) -> Vec<SE3> {
        let Some(cloud) = self.areas.get(area) else {
            return Vec::new();
        };
        (0..count)
            .map(|i| {
                let along = if count > 1 {
                    -0.6 + 1.2 * i as f64 / (count - 1) as f64
                } else {
                    0.0
                };
                let position = cloud.center + Vector3::new(along + lateral_offset, 0.0, -8.0);
                SE3::new(UnitQuaternion::identity(), position)
            })
            .collect()
    }

    /// Create keyframes at `poses` observing the cloud of `area`, in a map
    /// frame related to the scene frame by `frame` (map = frame * scene).
    ///
    /// Every call creates fresh map points, so observing an area twice yields
    /// duplicate landmarks. `parent` links the first new keyframe into the
    /// spanning tree when it shares no points with existing keyframes.
    pub fn observe(
        &self,
        map: &mut Map,
        vocabulary: &OrbVocabulary,
        levels_up: usize,
        area: usize,
        poses: &[SE3],
        frame: &Sim3,
        parent: Option<KeyFrameId>,
    ) -> Observation {
        let Some(cloud) = self.areas.get(area) else {
            return Observation {
                keyframes: Vec::new(),
                num_map_points: 0,
            };
        };
        let mut rng = StdRng::seed_from_u64(self.seed ^ ((area as u64) << 32) ^ map.num_keyframes() as u64);

        let mut keyframes = Vec::with_capacity(poses.len());
        let mut observed: Vec<Vec<(KeyFrameId, usize)>> = vec![Vec::new(); cloud.points.len()];

        for (k, pose) in poses.iter().enumerate() {
            let pose_cw = pose.inverse();
            let mut keypoints = Vec::new();
            let mut descriptors = Vec::new();
            let mut landmark_of_feature = Vec::new();

            for (j, point) in cloud.points.iter().enumerate() {
                let Some(uv) = self.camera.project(&pose_cw.transform_point(point)) else {
                    continue;
                };
                let inside = uv.x >= IMAGE_MARGIN
                    && uv.y >= IMAGE_MARGIN
                    && uv.x <= self.camera.max_x - IMAGE_MARGIN
                    && uv.y <= self.camera.max_y - IMAGE_MARGIN;
                if !inside {
                    continue;
                }
                let (du, dv) = if self.pixel_noise > 0.0 {
                    (
                        rng.gen_range(-self.pixel_noise..self.pixel_noise),
                        rng.gen_range(-self.pixel_noise..self.pixel_noise),
                    )
                } else {
                    (0.0, 0.0)
                };
                keypoints.push(KeyPoint::new(uv.x + du, uv.y + dv, 0));

                let mut descriptor = cloud.descriptors[j];
                let bit = (k * 37 + j) % 256;
                descriptor[bit / 8] ^= 1 << (bit % 8);
                descriptors.push(descriptor);
                landmark_of_feature.push(j);
            }

            let kf_id = map.create_keyframe(
                (map.num_keyframes() as u64) * 100_000_000,
                to_map_pose(frame, pose),
                self.camera,
                Arc::clone(&self.pyramid),
                keypoints,
                descriptors,
            );
            for (feature_idx, &j) in landmark_of_feature.iter().enumerate() {
                observed[j].push((kf_id, feature_idx));
            }
            keyframes.push(kf_id);
        }

        let mut num_map_points = 0;
        for (j, observers) in observed.iter().enumerate() {
            // A single observation cannot be triangulated.
            if observers.len() < 2 {
                continue;
            }
            let mp_id = map.create_map_point(
                frame.transform_point(&cloud.points[j]),
                cloud.descriptors[j],
                observers[0].0,
            );
            for &(kf_id, feature_idx) in observers {
                map.associate(kf_id, feature_idx, mp_id);
            }
            map.compute_distinctive_descriptor(mp_id);
            map.update_normal_and_depth(mp_id);
            num_map_points += 1;
        }

        for &kf_id in &keyframes {
            map.update_connections(kf_id);
            if let Some(kf) = map.get_keyframe_mut(kf_id) {
                let (bow, features) = vocabulary.transform(&kf.descriptors, levels_up);
                kf.set_bow(bow, features);
            }
        }
        if let (Some(parent), Some(&first)) = (parent, keyframes.first()) {
            if map.get_keyframe(first).is_some_and(|kf| kf.parent_id.is_none()) {
                map.set_parent(first, parent);
            }
        }

        Observation {
            keyframes,
            num_map_points,
        }
    }
}

/// Camera-to-world pose in the map frame. The scale of `frame` moves the
/// camera centre but leaves the orientation untouched.
fn to_map_pose(frame: &Sim3, pose: &SE3) -> SE3 {
    SE3::new(
        frame.rotation * pose.rotation,
        frame.transform_point(&pose.translation),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_generation_is_deterministic() {
        let a = SyntheticScene::generate(&SceneConfig::default());
        let b = SyntheticScene::generate(&SceneConfig::default());
        assert_eq!(a.areas[0].descriptors, b.areas[0].descriptors);
        assert_relative_eq!(a.areas[0].points[5], b.areas[0].points[5]);
    }

    #[test]
    fn test_observe_builds_connected_keyframes() {
        let scene = SyntheticScene::generate(&SceneConfig::default());
        let vocabulary = scene.vocabulary().unwrap();
        let mut map = Map::new();
        let poses = scene.viewpoints(0, 5, 0.0);
        let obs = scene.observe(&mut map, &vocabulary, 4, 0, &poses, &Sim3::identity(), None);

        assert_eq!(obs.keyframes.len(), 5);
        assert!(obs.num_map_points > 100);
        let kf = map.get_keyframe(obs.keyframes[2]).unwrap();
        assert!(kf.num_map_points() > 100);
        assert_eq!(map.connected_keyframes(obs.keyframes[2]).len(), 4);
        assert!(kf.bow_vector().is_some());
    }

    #[test]
    fn test_scaled_frame_keeps_pixels() {
        let scene = SyntheticScene::generate(&SceneConfig::default());
        let vocabulary = scene.vocabulary().unwrap();
        let poses = scene.viewpoints(0, 2, 0.0);

        let mut unit = Map::new();
        let a = scene.observe(&mut unit, &vocabulary, 4, 0, &poses, &Sim3::identity(), None);
        let mut scaled = Map::new();
        let frame = Sim3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(5.0, 0.0, 0.0), 2.0);
        let b = scene.observe(&mut scaled, &vocabulary, 4, 0, &poses, &frame, None);

        let kf_a = unit.get_keyframe(a.keyframes[0]).unwrap();
        let kf_b = scaled.get_keyframe(b.keyframes[0]).unwrap();
        assert_eq!(kf_a.keypoints.len(), kf_b.keypoints.len());
        assert_relative_eq!(kf_a.keypoints[3].x, kf_b.keypoints[3].x, epsilon = 1e-9);
        assert_relative_eq!(kf_b.pose.translation.x, 2.0 * kf_a.pose.translation.x + 5.0, epsilon = 1e-9);
    }
}
