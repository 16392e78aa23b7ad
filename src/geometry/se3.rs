//! SE3: rigid body transformation (rotation + translation).
//!
//! Keyframe poses are stored as `T_wc` (camera-to-world). Use `inverse()` to
//! obtain `T_cw` before projecting world points into a camera.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};

/// Rigid transformation: p' = R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from quaternion (w, x, y, z) and translation.
    ///
    /// The quaternion is normalized, so slightly denormalized input is accepted.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_quaternion(Quaternion::new(qw, qx, qy, qz)),
            translation,
        }
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// self ∘ other
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Left-multiplicative update `exp([ω, υ]) * self`, first order in the
    /// translational part. Matches the perturbation used by the BA Jacobians.
    pub fn left_update(&self, omega: &Vector3<f64>, upsilon: &Vector3<f64>) -> Self {
        let dr = UnitQuaternion::from_scaled_axis(*omega);
        Self {
            rotation: dr * self.rotation,
            translation: dr * self.translation + upsilon,
        }
    }

    /// Quaternion coefficients as (w, x, y, z).
    pub fn quaternion_wxyz(&self) -> [f64; 4] {
        let q = self.rotation.quaternion();
        [q.w, q.i, q.j, q.k]
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
