//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Loop closures between two monocular maps carry an unknown relative scale,
//! so corrections are expressed as Sim3. With `fix_scale` (stereo/RGB-D) the
//! scale stays at 1.0 and Sim3 degenerates to SE3.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::so3::closest_rotation;
use super::SE3;

/// Smallest scale accepted as a valid similarity.
const MIN_SCALE: f64 = 1e-9;

/// Similarity transformation: p' = s * R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from a rotation matrix, translation and scale.
    ///
    /// The matrix is projected onto SO(3) first, so numerically drifted input
    /// (e.g. straight out of an SVD or an optimizer) still yields det(R) = +1.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(closest_rotation(&rotation));
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    /// Construct from SE3 with scale = 1.0.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Construct from quaternion (w, x, y, z), translation, and scale.
    pub fn from_quaternion(
        qw: f64,
        qx: f64,
        qy: f64,
        qz: f64,
        translation: Vector3<f64>,
        scale: f64,
    ) -> Self {
        let rotation =
            UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
            scale,
        }
    }

    /// Drop the scale, keeping rotation and translation.
    ///
    /// For a camera-to-world similarity `S_wc` this is exactly the rigid pose
    /// the corrected keyframe should carry: the camera center is preserved and
    /// the scale is absorbed by the (already transformed) map points.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation,
        }
    }

    /// S^{-1} = [(1/s)R^T | -(1/s)R^T*t]
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        let t_inv = -(rot_inv * self.translation) * scale_inv;
        Self {
            rotation: rot_inv,
            translation: t_inv,
            scale: scale_inv,
        }
    }

    /// self ∘ other = [s1*s2*R1*R2 | s1*R1*t2 + t1]
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// True when every component is finite and the scale is strictly positive.
    pub fn is_valid(&self) -> bool {
        self.scale.is_finite()
            && self.scale > MIN_SCALE
            && self.translation.iter().all(|v| v.is_finite())
            && self.rotation.coords.iter().all(|v| v.is_finite())
    }

    /// Re-orthonormalize the rotation and validate the scale.
    ///
    /// Returns `None` for a degenerate similarity (non-positive or non-finite
    /// scale, non-finite translation); otherwise the rotation is renormalized
    /// so that det(R) = +1 holds exactly.
    pub fn renormalize(&self) -> Option<Self> {
        if !self.is_valid() {
            return None;
        }
        Some(Self::from_rts(self.rotation_matrix(), self.translation, self.scale))
    }

    /// [rotation_vec (3), translation (3), log_scale (1)]
    ///
    /// Not the true Sim3 logarithm, but a smooth chart around the current
    /// estimate, which is all the pose-graph solver needs.
    pub fn log(&self) -> [f64; 7] {
        let rot_vec = self.rotation.scaled_axis();
        [
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
            self.scale.ln(),
        ]
    }

    /// Inverse of [`Sim3::log`].
    pub fn exp(tangent: &[f64; 7]) -> Self {
        let rot_vec = Vector3::new(tangent[0], tangent[1], tangent[2]);
        Self {
            rotation: UnitQuaternion::from_scaled_axis(rot_vec),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
            scale: tangent[6].exp(),
        }
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
            translation: Vector3::new(1.0, 2.0, 3.0),
            scale: 2.0,
        }
    }

    #[test]
    fn test_identity() {
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(Sim3::identity().transform_point(&p), p, epsilon = 1e-10);
    }

    #[test]
    fn test_inverse() {
        let sim3 = sample();
        let composed = sim3.compose(&sim3.inverse());
        assert_relative_eq!(composed.scale, 1.0, epsilon = 1e-10);
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-10);

        let p = Vector3::new(1.0, 2.0, 3.0);
        let p_back = sim3.inverse().transform_point(&sim3.transform_point(&p));
        assert_relative_eq!(p_back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_compose() {
        let s1 = Sim3 {
            translation: Vector3::new(1.0, 0.0, 0.0),
            scale: 2.0,
            ..Sim3::identity()
        };
        let s2 = Sim3 {
            translation: Vector3::new(0.0, 1.0, 0.0),
            scale: 3.0,
            ..Sim3::identity()
        };
        let composed = s1.compose(&s2);
        assert_relative_eq!(composed.scale, 6.0, epsilon = 1e-10);
        // (1,0,0) + 2*(0,1,0)
        assert_relative_eq!(composed.translation, Vector3::new(1.0, 2.0, 0.0), epsilon = 1e-10);
    }

    #[test]
    fn test_transform_point_with_scale() {
        let sim3 = Sim3 {
            translation: Vector3::new(1.0, 0.0, 0.0),
            scale: 2.0,
            ..Sim3::identity()
        };
        let p = sim3.transform_point(&Vector3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(p, Vector3::new(3.0, 2.0, 2.0), epsilon = 1e-10);
    }

    #[test]
    fn test_from_se3_keeps_pose() {
        let se3 = SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(1.0, 2.0, 3.0));
        let sim3 = Sim3::from_se3(&se3);
        assert_eq!(sim3.scale, 1.0);
        assert_eq!(sim3.to_se3(), se3);
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let sim3 = sample();
        let back = Sim3::exp(&sim3.log());
        assert_relative_eq!(sim3.scale, back.scale, epsilon = 1e-10);
        assert_relative_eq!(sim3.translation, back.translation, epsilon = 1e-10);
        assert_relative_eq!(sim3.rotation.angle_to(&back.rotation), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_renormalize_rejects_bad_scale() {
        let mut sim3 = sample();
        sim3.scale = 0.0;
        assert!(sim3.renormalize().is_none());
        sim3.scale = -1.0;
        assert!(sim3.renormalize().is_none());
        sim3.scale = f64::NAN;
        assert!(sim3.renormalize().is_none());
    }

    #[test]
    fn test_from_rts_orthonormalizes() {
        let r = Rotation3::from_euler_angles(0.1, 0.2, 0.3).into_inner() * 1.001;
        let sim3 = Sim3::from_rts(r, Vector3::zeros(), 1.5);
        assert_relative_eq!(sim3.rotation_matrix().determinant(), 1.0, epsilon = 1e-9);
        let fixed = sample().renormalize().unwrap();
        assert_relative_eq!(fixed.scale, 2.0, epsilon = 1e-12);
    }
}
