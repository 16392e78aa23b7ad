//! Pinhole camera model and ORB scale pyramid.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics plus the undistorted image bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: f64, height: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            min_x: 0.0,
            min_y: 0.0,
            max_x: width,
            max_y: height,
        }
    }

    /// Project a point in the camera frame. `None` when behind the camera.
    #[inline]
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some(Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    #[inline]
    pub fn is_in_image(&self, uv: &Vector2<f64>) -> bool {
        uv.x >= self.min_x && uv.x < self.max_x && uv.y >= self.min_y && uv.y < self.max_y
    }

    /// Back-project a pixel at the given depth.
    pub fn unproject(&self, uv: &Vector2<f64>, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (uv.x - self.cx) * depth / self.fx,
            (uv.y - self.cy) * depth / self.fy,
            depth,
        )
    }

    pub fn is_valid(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy, self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.fx > 0.0
            && self.fy > 0.0
            && self.max_x > self.min_x
            && self.max_y > self.min_y
    }
}

/// Per-level scale factors and measurement uncertainties of an ORB pyramid.
///
/// `level_sigma2[i] = scale_factor^(2i)`: a keypoint detected at octave `i`
/// has a pixel uncertainty that grows with the level scale.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePyramid {
    pub scale_factor: f64,
    pub num_levels: usize,
    pub scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
    log_scale_factor: f64,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, num_levels: usize) -> Self {
        let num_levels = num_levels.max(1);
        let scale_factors: Vec<f64> = (0..num_levels)
            .map(|i| scale_factor.powi(i as i32))
            .collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        let inv_level_sigma2 = level_sigma2.iter().map(|s2| 1.0 / s2).collect();
        Self {
            scale_factor,
            num_levels,
            scale_factors,
            level_sigma2,
            inv_level_sigma2,
            log_scale_factor: scale_factor.ln(),
        }
    }

    #[inline]
    pub fn scale(&self, level: usize) -> f64 {
        self.scale_factors[level.min(self.num_levels - 1)]
    }

    #[inline]
    pub fn sigma2(&self, level: usize) -> f64 {
        self.level_sigma2[level.min(self.num_levels - 1)]
    }

    #[inline]
    pub fn inv_sigma2(&self, level: usize) -> f64 {
        self.inv_level_sigma2[level.min(self.num_levels - 1)]
    }

    /// Predict the pyramid level at which a point with the given maximum
    /// distance invariance would be observed from `distance`.
    pub fn predict_scale(&self, distance: f64, max_distance: f64) -> usize {
        if distance <= 0.0 || max_distance <= 0.0 {
            return 0;
        }
        let ratio = max_distance / distance;
        let level = (ratio.ln() / self.log_scale_factor).ceil();
        if level < 0.0 {
            0
        } else {
            (level as usize).min(self.num_levels - 1)
        }
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0)
    }

    #[test]
    fn test_project_unproject() {
        let cam = camera();
        let p = Vector3::new(0.5, -0.25, 4.0);
        let uv = cam.project(&p).unwrap();
        assert!(cam.is_in_image(&uv));
        assert_relative_eq!(cam.unproject(&uv, 4.0), p, epsilon = 1e-12);
    }

    #[test]
    fn test_project_behind_camera() {
        assert!(camera().project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn test_pyramid_sigmas() {
        let pyramid = ScalePyramid::default();
        assert_eq!(pyramid.num_levels, 8);
        assert_relative_eq!(pyramid.sigma2(0), 1.0);
        assert_relative_eq!(pyramid.sigma2(1), 1.44, epsilon = 1e-12);
        assert_relative_eq!(pyramid.inv_sigma2(2) * pyramid.sigma2(2), 1.0, epsilon = 1e-12);
        // Out of range levels clamp to the coarsest one.
        assert_relative_eq!(pyramid.scale(100), pyramid.scale(7));
    }

    #[test]
    fn test_predict_scale() {
        let pyramid = ScalePyramid::default();
        assert_eq!(pyramid.predict_scale(10.0, 10.0), 0);
        assert_eq!(pyramid.predict_scale(10.0, 12.0), 1);
        assert_eq!(pyramid.predict_scale(0.001, 10.0), 7);
    }
}
