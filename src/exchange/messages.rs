//! Robot-agnostic wire records exchanged between robots.
//!
//! Only plain numbers and arrays cross the wire. A keyframe travels as a
//! [`KeyFrameBundle`]: the keyframe header, one [`KeypointMsg`] per feature,
//! an [`IndicesMsg`] mapping features to entries of the bundled landmark list,
//! and the landmarks themselves.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::atlas::map::{Descriptor, KeyFrameId, KeyFrameSnapshot, KeyPoint, LandmarkSnapshot, MapPointId};
use crate::error::{LoopClosingError, Result};
use crate::geometry::{CameraModel, ScalePyramid, Sim3, SE3};
use crate::vocabulary::{BowVector, FeatureVector};

/// Bits reserved for the index part of a packed key.
const KEY_INDEX_BITS: u32 = 56;
const KEY_INDEX_MASK: u64 = (1 << KEY_INDEX_BITS) - 1;

/// Largest image pyramid a remote keyframe may declare. ORB extractors use 8.
pub const MAX_PYRAMID_LEVELS: u32 = 16;
/// Largest scale step between pyramid levels a remote keyframe may declare.
pub const MAX_SCALE_FACTOR: f64 = 4.0;

/// Pack a robot symbol and a per-robot index into one key, as factor-graph
/// back ends label variables (`symbol << 56 | index`).
pub fn symbol_key(symbol: char, index: u64) -> u64 {
    ((symbol as u64 & 0xff) << KEY_INDEX_BITS) | (index & KEY_INDEX_MASK)
}

/// Inverse of [`symbol_key`].
pub fn symbol_parts(key: u64) -> (char, u64) {
    (((key >> KEY_INDEX_BITS) as u8) as char, key & KEY_INDEX_MASK)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraMsg {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyframeMsg {
    pub robot_id: u32,
    pub robot_symbol: char,
    pub kf_id: u64,
    pub timestamp_ns: u64,
    /// Camera-to-world rotation as [w, x, y, z].
    pub rotation: [f64; 4],
    pub translation: [f64; 3],
    pub camera: CameraMsg,
    pub scale_factor: f64,
    pub n_levels: u32,
    pub descriptors: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeypointMsg {
    pub x: f64,
    pub y: f64,
    pub size: f64,
    pub angle: f64,
    pub response: f64,
    pub octave: i32,
}

/// Per feature, the index of its landmark in the bundle; -1 for none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicesMsg {
    pub landmark_indices: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkMsg {
    pub id: u64,
    pub position: [f64; 3],
    pub descriptor: Vec<u8>,
    pub normal: [f64; 3],
    pub min_distance: f64,
    pub max_distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementKind {
    Odometry,
    LoopClosure,
}

/// Relative similarity between two packed keys: `key1 ← key2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementMsg {
    pub robot_id: u32,
    pub kind: MeasurementKind,
    pub key1: u64,
    pub key2: u64,
    /// [w, x, y, z]
    pub rotation: [f64; 4],
    pub translation: [f64; 3],
    pub scale: f64,
}

impl MeasurementMsg {
    pub fn new(robot_id: u32, kind: MeasurementKind, key1: u64, key2: u64, relative: &Sim3) -> Self {
        let q = relative.rotation;
        Self {
            robot_id,
            kind,
            key1,
            key2,
            rotation: [q.w, q.i, q.j, q.k],
            translation: [relative.translation.x, relative.translation.y, relative.translation.z],
            scale: relative.scale,
        }
    }

    pub fn relative(&self) -> Sim3 {
        let [w, x, y, z] = self.rotation;
        Sim3::from_quaternion(w, x, y, z, Vector3::from(self.translation), self.scale)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyFrameBundle {
    pub keyframe: KeyframeMsg,
    pub keypoints: Vec<KeypointMsg>,
    pub indices: IndicesMsg,
    pub landmarks: Vec<LandmarkMsg>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    KeyFrame(KeyFrameBundle),
    Measurement(MeasurementMsg),
}

impl KeyFrameBundle {
    /// Serialize a local keyframe. Landmarks shared by several features are
    /// sent once.
    pub fn from_snapshot(robot_id: u32, robot_symbol: char, kf: &KeyFrameSnapshot) -> Self {
        let q = kf.pose.rotation;
        let keyframe = KeyframeMsg {
            robot_id,
            robot_symbol,
            kf_id: kf.id.0,
            timestamp_ns: kf.timestamp_ns,
            rotation: [q.w, q.i, q.j, q.k],
            translation: [kf.pose.translation.x, kf.pose.translation.y, kf.pose.translation.z],
            camera: CameraMsg {
                fx: kf.camera.fx,
                fy: kf.camera.fy,
                cx: kf.camera.cx,
                cy: kf.camera.cy,
                width: kf.camera.max_x,
                height: kf.camera.max_y,
            },
            scale_factor: kf.pyramid.scale_factor,
            n_levels: kf.pyramid.num_levels as u32,
            descriptors: kf.descriptors.iter().map(|d| d.to_vec()).collect(),
        };

        let keypoints = kf
            .keypoints
            .iter()
            .map(|kp| KeypointMsg {
                x: kp.x,
                y: kp.y,
                size: kp.size,
                angle: kp.angle,
                response: kp.response,
                octave: kp.octave as i32,
            })
            .collect();

        let mut slot_of: HashMap<MapPointId, i64> = HashMap::new();
        let mut landmarks = Vec::new();
        let landmark_indices = kf
            .landmarks
            .iter()
            .map(|lm| match lm {
                Some(lm) => *slot_of.entry(lm.id).or_insert_with(|| {
                    landmarks.push(LandmarkMsg {
                        id: lm.id.0,
                        position: [lm.position.x, lm.position.y, lm.position.z],
                        descriptor: lm.descriptor.to_vec(),
                        normal: [lm.normal.x, lm.normal.y, lm.normal.z],
                        min_distance: lm.min_distance,
                        max_distance: lm.max_distance,
                    });
                    landmarks.len() as i64 - 1
                }),
                None => -1,
            })
            .collect();

        Self {
            keyframe,
            keypoints,
            indices: IndicesMsg { landmark_indices },
            landmarks,
        }
    }

    /// Reject bundles that cannot describe a keyframe. Landmark problems are
    /// not fatal; they only remove correspondences.
    pub fn validate(&self) -> Result<()> {
        fn malformed(what: impl Into<String>) -> Result<()> {
            Err(LoopClosingError::MalformedMessage(what.into()))
        }

        let kf = &self.keyframe;
        let n = kf.descriptors.len();
        if n == 0 {
            return malformed("keyframe without features");
        }
        if self.keypoints.len() != n || self.indices.landmark_indices.len() != n {
            return malformed(format!(
                "feature count mismatch: {} descriptors, {} keypoints, {} indices",
                n,
                self.keypoints.len(),
                self.indices.landmark_indices.len()
            ));
        }
        if kf.descriptors.iter().any(|d| d.len() != 32) {
            return malformed("descriptor is not 32 bytes");
        }
        if !kf.rotation.iter().chain(&kf.translation).all(|v| v.is_finite()) {
            return malformed("non-finite pose");
        }
        let q_norm = kf.rotation.iter().map(|v| v * v).sum::<f64>().sqrt();
        if q_norm < 1e-6 {
            return malformed("degenerate rotation");
        }
        let cam = &kf.camera;
        let intrinsics = [cam.fx, cam.fy, cam.width, cam.height];
        if !intrinsics.iter().all(|v| v.is_finite() && *v > 0.0) || !cam.cx.is_finite() || !cam.cy.is_finite() {
            return malformed("invalid intrinsics");
        }
        if !(kf.scale_factor > 1.0 && kf.scale_factor <= MAX_SCALE_FACTOR)
            || kf.n_levels == 0
            || kf.n_levels > MAX_PYRAMID_LEVELS
        {
            return malformed("invalid scale pyramid");
        }
        for kp in &self.keypoints {
            if !(kp.x.is_finite() && kp.y.is_finite()) {
                return malformed("non-finite keypoint");
            }
            if kp.octave < 0 || kp.octave as u32 >= kf.n_levels {
                return malformed(format!("octave {} outside pyramid", kp.octave));
            }
        }
        Ok(())
    }

    /// Rebuild a detached keyframe in the sender's namespace: ids become
    /// packed keys so they never collide with local ids. Call
    /// [`Self::validate`] first.
    pub fn to_snapshot(&self, bow_vector: BowVector, feature_vector: FeatureVector) -> KeyFrameSnapshot {
        let kf = &self.keyframe;
        let [w, x, y, z] = kf.rotation;
        let pose = SE3::from_quaternion(w, x, y, z, Vector3::from(kf.translation));

        let landmarks: Vec<Option<LandmarkSnapshot>> = self
            .indices
            .landmark_indices
            .iter()
            .map(|&idx| {
                let lm = usize::try_from(idx).ok().and_then(|i| self.landmarks.get(i))?;
                landmark_from_msg(kf.robot_symbol, lm)
            })
            .collect();

        KeyFrameSnapshot {
            id: KeyFrameId::new(symbol_key(kf.robot_symbol, kf.kf_id)),
            timestamp_ns: kf.timestamp_ns,
            pose,
            camera: CameraModel::new(
                kf.camera.fx,
                kf.camera.fy,
                kf.camera.cx,
                kf.camera.cy,
                kf.camera.width,
                kf.camera.height,
            ),
            pyramid: Arc::new(ScalePyramid::new(
                kf.scale_factor,
                kf.n_levels.min(MAX_PYRAMID_LEVELS) as usize,
            )),
            keypoints: self
                .keypoints
                .iter()
                .map(|kp| KeyPoint {
                    x: kp.x,
                    y: kp.y,
                    size: kp.size,
                    angle: kp.angle,
                    response: kp.response,
                    octave: kp.octave.max(0) as usize,
                })
                .collect(),
            descriptors: self.descriptors(),
            bow_vector,
            feature_vector,
            landmarks,
        }
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.keyframe
            .descriptors
            .iter()
            .map(|d| {
                let mut out = [0u8; 32];
                let n = d.len().min(32);
                out[..n].copy_from_slice(&d[..n]);
                out
            })
            .collect()
    }
}

fn landmark_from_msg(symbol: char, lm: &LandmarkMsg) -> Option<LandmarkSnapshot> {
    let position = Vector3::from(lm.position);
    if !position.iter().all(|v| v.is_finite()) || lm.descriptor.len() != 32 {
        return None;
    }
    let mut descriptor = [0u8; 32];
    descriptor.copy_from_slice(&lm.descriptor);
    let normal = Vector3::from(lm.normal);
    Some(LandmarkSnapshot {
        id: MapPointId::new(symbol_key(symbol, lm.id)),
        position,
        descriptor,
        normal: if normal.iter().all(|v| v.is_finite()) { normal } else { Vector3::zeros() },
        min_distance: lm.min_distance,
        max_distance: lm.max_distance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn snapshot() -> KeyFrameSnapshot {
        let lm = |id: u64, x: f64| LandmarkSnapshot {
            id: MapPointId::new(id),
            position: Vector3::new(x, 0.5, 8.0),
            descriptor: [id as u8; 32],
            normal: Vector3::z(),
            min_distance: 1.0,
            max_distance: 20.0,
        };
        KeyFrameSnapshot {
            id: KeyFrameId::new(7),
            timestamp_ns: 42,
            pose: SE3::from_quaternion(0.9, 0.1, 0.3, 0.0, Vector3::new(1.0, 2.0, 3.0)),
            camera: CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0),
            pyramid: Arc::new(ScalePyramid::default()),
            keypoints: vec![KeyPoint::new(10.0, 20.0, 0), KeyPoint::new(30.0, 40.0, 2), KeyPoint::new(50.0, 60.0, 1)],
            descriptors: vec![[1u8; 32], [2u8; 32], [3u8; 32]],
            bow_vector: BowVector::new(),
            feature_vector: FeatureVector::new(),
            landmarks: vec![Some(lm(5, 1.0)), None, Some(lm(9, -1.0))],
        }
    }

    #[test]
    fn test_symbol_key_packing() {
        let key = symbol_key('b', 12);
        assert_eq!(key, (b'b' as u64) << 56 | 12);
        assert_eq!(symbol_parts(key), ('b', 12));
    }

    #[test]
    fn test_bundle_preserves_keyframe() {
        let kf = snapshot();
        let bundle = KeyFrameBundle::from_snapshot(1, 'a', &kf);
        assert!(bundle.validate().is_ok());
        assert_eq!(bundle.indices.landmark_indices, vec![0, -1, 1]);
        assert_eq!(bundle.landmarks.len(), 2);

        let back = bundle.to_snapshot(BowVector::new(), FeatureVector::new());
        assert_eq!(back.id, KeyFrameId::new(symbol_key('a', 7)));
        assert_relative_eq!(back.pose.translation, kf.pose.translation, epsilon = 1e-12);
        assert_relative_eq!(back.pose.rotation.angle_to(&kf.pose.rotation), 0.0, epsilon = 1e-12);
        assert_eq!(back.descriptors, kf.descriptors);
        assert_eq!(back.keypoints[1].octave, 2);
        assert!(back.landmarks[1].is_none());
        assert_eq!(back.landmark(2).unwrap().id, MapPointId::new(symbol_key('a', 9)));
    }

    #[test]
    fn test_validation_rejects_mismatched_counts() {
        let mut bundle = KeyFrameBundle::from_snapshot(1, 'a', &snapshot());
        bundle.keypoints.pop();
        assert!(matches!(bundle.validate(), Err(LoopClosingError::MalformedMessage(_))));
    }

    #[test]
    fn test_validation_rejects_bad_descriptor_and_octave() {
        let mut bundle = KeyFrameBundle::from_snapshot(1, 'a', &snapshot());
        bundle.keyframe.descriptors[0] = vec![0u8; 16];
        assert!(bundle.validate().is_err());

        let mut bundle = KeyFrameBundle::from_snapshot(1, 'a', &snapshot());
        bundle.keypoints[0].octave = 8;
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_oversized_pyramid() {
        let mut bundle = KeyFrameBundle::from_snapshot(1, 'a', &snapshot());
        bundle.keyframe.n_levels = u32::MAX;
        assert!(matches!(bundle.validate(), Err(LoopClosingError::MalformedMessage(_))));

        bundle.keyframe.n_levels = MAX_PYRAMID_LEVELS + 1;
        assert!(bundle.validate().is_err());
        bundle.keyframe.n_levels = MAX_PYRAMID_LEVELS;
        assert!(bundle.validate().is_ok());

        // Rebuilding never allocates more levels than a valid bundle can have.
        bundle.keyframe.n_levels = 20_000_000;
        let back = bundle.to_snapshot(BowVector::new(), FeatureVector::new());
        assert_eq!(back.pyramid.num_levels, MAX_PYRAMID_LEVELS as usize);
    }

    #[test]
    fn test_validation_rejects_extreme_scale_factor() {
        let mut bundle = KeyFrameBundle::from_snapshot(1, 'a', &snapshot());
        for factor in [1.0, 0.5, f64::NAN, f64::INFINITY, 1e9] {
            bundle.keyframe.scale_factor = factor;
            assert!(
                matches!(bundle.validate(), Err(LoopClosingError::MalformedMessage(_))),
                "scale factor {} accepted",
                factor
            );
        }
        bundle.keyframe.scale_factor = 1.2;
        assert!(bundle.validate().is_ok());
    }

    #[test]
    fn test_bad_landmark_index_means_no_correspondence() {
        let mut bundle = KeyFrameBundle::from_snapshot(1, 'a', &snapshot());
        bundle.indices.landmark_indices = vec![17, -4, 0];
        bundle.landmarks[0].position[0] = f64::NAN;
        assert!(bundle.validate().is_ok());
        let back = bundle.to_snapshot(BowVector::new(), FeatureVector::new());
        assert_eq!(back.num_landmarks(), 0);
    }

    #[test]
    fn test_measurement_relative_round_trip() {
        let rel = Sim3::from_quaternion(0.8, 0.0, 0.6, 0.0, Vector3::new(1.0, -2.0, 0.5), 2.0);
        let msg = MeasurementMsg::new(3, MeasurementKind::LoopClosure, 1, 2, &rel);
        let back = msg.relative();
        assert_relative_eq!(back.scale, 2.0, epsilon = 1e-12);
        assert_relative_eq!(back.translation, rel.translation, epsilon = 1e-12);
    }
}
