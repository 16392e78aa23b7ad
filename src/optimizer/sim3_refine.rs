//! Sim3 refinement between two keyframes by two-way reprojection.
//!
//! Each correspondence links a landmark of keyframe 1 to a landmark of
//! keyframe 2. The landmark of 2 is mapped into camera 1 through S12 and
//! compared with the keypoint observed in 1, and symmetrically through S21.
//! The problem is solved with the `levenberg-marquardt` crate in two rounds;
//! correspondences whose chi2 exceeds the threshold after the first round are
//! dropped before the second.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Owned, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::{CameraModel, Sim3};

/// Residual assigned to a point projecting behind a camera.
const BEHIND_CAMERA_RESIDUAL: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sim3RefineConfig {
    /// chi2 threshold (2 DOF) above which a correspondence is an outlier.
    pub chi2_threshold: f64,
    /// LM patience for the first and second round.
    pub first_round_patience: usize,
    pub second_round_patience: usize,
}

impl Default for Sim3RefineConfig {
    fn default() -> Self {
        Self {
            chi2_threshold: 10.0,
            first_round_patience: 5,
            second_round_patience: 10,
        }
    }
}

/// One landmark pair seen by both keyframes.
#[derive(Debug, Clone, Copy)]
pub struct Sim3Correspondence {
    /// Landmark of keyframe 1 in camera 1 coordinates.
    pub p1: Vector3<f64>,
    /// Landmark of keyframe 2 in camera 2 coordinates.
    pub p2: Vector3<f64>,
    /// Keypoint observed in keyframe 1.
    pub uv1: Vector2<f64>,
    /// Keypoint observed in keyframe 2.
    pub uv2: Vector2<f64>,
    pub inv_sigma2_1: f64,
    pub inv_sigma2_2: f64,
}

#[derive(Debug, Clone)]
pub struct Sim3RefineResult {
    pub s12: Sim3,
    /// Inlier flag per input correspondence.
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
}

struct Sim3Problem<'a> {
    correspondences: &'a [Sim3Correspondence],
    active: &'a [bool],
    camera1: &'a CameraModel,
    camera2: &'a CameraModel,
    fix_scale: bool,
    fixed_log_scale: f64,
    /// Robust weight per correspondence and direction, frozen for a round.
    weights: Vec<(f64, f64)>,
    params: DVector<f64>,
}

impl Sim3Problem<'_> {
    fn sim3(&self, params: &DVector<f64>) -> Sim3 {
        let log_scale = if self.fix_scale {
            self.fixed_log_scale
        } else {
            params[6]
        };
        Sim3::exp(&[
            params[0], params[1], params[2], params[3], params[4], params[5], log_scale,
        ])
    }

    /// Unweighted reprojection errors of one correspondence in image 1 and 2.
    fn errors(&self, s12: &Sim3, s21: &Sim3, c: &Sim3Correspondence) -> (Vector2<f64>, Vector2<f64>) {
        let e1 = reprojection_error(self.camera1, &s12.transform_point(&c.p2), &c.uv1);
        let e2 = reprojection_error(self.camera2, &s21.transform_point(&c.p1), &c.uv2);
        (e1, e2)
    }

    fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let s12 = self.sim3(params);
        let s21 = s12.inverse();
        let mut residuals = DVector::zeros(self.num_residuals());
        let mut row = 0;
        for (i, c) in self.correspondences.iter().enumerate() {
            if !self.active[i] {
                continue;
            }
            let (e1, e2) = self.errors(&s12, &s21, c);
            let (w1, w2) = self.weights[i];
            let k1 = (c.inv_sigma2_1 * w1).sqrt();
            let k2 = (c.inv_sigma2_2 * w2).sqrt();
            residuals[row] = e1.x * k1;
            residuals[row + 1] = e1.y * k1;
            residuals[row + 2] = e2.x * k2;
            residuals[row + 3] = e2.y * k2;
            row += 4;
        }
        residuals
    }

    fn num_residuals(&self) -> usize {
        self.active.iter().filter(|a| **a).count() * 4
    }

    /// Freeze Huber weights at the current estimate.
    fn update_weights(&mut self, huber_delta_sq: f64) {
        let s12 = self.sim3(&self.params);
        let s21 = s12.inverse();
        self.weights = self
            .correspondences
            .iter()
            .map(|c| {
                let (e1, e2) = self.errors(&s12, &s21, c);
                (
                    huber_weight(e1.norm_squared() * c.inv_sigma2_1, huber_delta_sq),
                    huber_weight(e2.norm_squared() * c.inv_sigma2_2, huber_delta_sq),
                )
            })
            .collect();
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for Sim3Problem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let eps = 1e-6;
        let n = self.params.len();
        let mut jacobian = DMatrix::zeros(self.num_residuals(), n);
        for p in 0..n {
            let mut plus = self.params.clone();
            let mut minus = self.params.clone();
            plus[p] += eps;
            minus[p] -= eps;
            let column = (self.residuals_at(&plus) - self.residuals_at(&minus)) / (2.0 * eps);
            jacobian.set_column(p, &column);
        }
        Some(jacobian)
    }
}

fn reprojection_error(camera: &CameraModel, p_cam: &Vector3<f64>, observed: &Vector2<f64>) -> Vector2<f64> {
    match camera.project(p_cam) {
        Some(uv) => observed - uv,
        None => Vector2::new(BEHIND_CAMERA_RESIDUAL, BEHIND_CAMERA_RESIDUAL),
    }
}

/// IRLS weight of the Huber kernel for a squared, whitened error.
fn huber_weight(chi2: f64, delta_sq: f64) -> f64 {
    if chi2 <= delta_sq {
        1.0
    } else {
        (delta_sq / chi2).sqrt()
    }
}

/// Refine `s12` (camera 2 → camera 1) over `correspondences`.
///
/// Returns `None` when the estimate degenerates. `fix_scale` keeps the
/// initial scale (stereo / RGB-D).
pub fn optimize_sim3(
    correspondences: &[Sim3Correspondence],
    camera1: &CameraModel,
    camera2: &CameraModel,
    initial: &Sim3,
    fix_scale: bool,
    config: &Sim3RefineConfig,
) -> Option<Sim3RefineResult> {
    let log = initial.log();
    let n_params = if fix_scale { 6 } else { 7 };
    let mut inliers = vec![true; correspondences.len()];

    let mut params = DVector::from_column_slice(&log[..n_params]);
    for patience in [config.first_round_patience, config.second_round_patience] {
        let active = inliers.clone();
        if active.iter().filter(|a| **a).count() * 4 < n_params {
            return None;
        }
        let mut problem = Sim3Problem {
            correspondences,
            active: &active,
            camera1,
            camera2,
            fix_scale,
            fixed_log_scale: log[6],
            weights: Vec::new(),
            params: params.clone(),
        };
        problem.update_weights(config.chi2_threshold);

        let (problem, report) = LevenbergMarquardt::new()
            .with_patience(patience)
            .minimize(problem);
        tracing::trace!(
            termination = ?report.termination,
            evaluations = report.number_of_evaluations,
            objective = report.objective_function,
            "sim3 refinement round"
        );
        params = problem.params.clone();

        let s12 = problem.sim3(&params);
        let s21 = s12.inverse();
        for (i, c) in correspondences.iter().enumerate() {
            if !inliers[i] {
                continue;
            }
            let (e1, e2) = problem.errors(&s12, &s21, c);
            let chi2_1 = e1.norm_squared() * c.inv_sigma2_1;
            let chi2_2 = e2.norm_squared() * c.inv_sigma2_2;
            if chi2_1 > config.chi2_threshold || chi2_2 > config.chi2_threshold {
                inliers[i] = false;
            }
        }
    }

    let mut tangent = log;
    tangent[..n_params].copy_from_slice(params.as_slice());
    let s12 = Sim3::exp(&tangent).renormalize()?;
    let num_inliers = inliers.iter().filter(|i| **i).count();
    Some(Sim3RefineResult {
        s12,
        inliers,
        num_inliers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn camera() -> CameraModel {
        CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0)
    }

    /// Correspondences generated from a known S12 and points in camera 2.
    fn scene(s12: &Sim3) -> Vec<Sim3Correspondence> {
        let cam = camera();
        let mut out = Vec::new();
        for i in 0..40 {
            let p2 = Vector3::new(
                (i % 8) as f64 * 0.5 - 1.75,
                (i / 8) as f64 * 0.5 - 1.0,
                5.0 + (i % 5) as f64 * 0.4,
            );
            let p1 = s12.transform_point(&p2);
            out.push(Sim3Correspondence {
                p1,
                p2,
                uv1: cam.project(&p1).unwrap(),
                uv2: cam.project(&p2).unwrap(),
                inv_sigma2_1: 1.0,
                inv_sigma2_2: 1.0,
            });
        }
        out
    }

    fn truth() -> Sim3 {
        Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.02, -0.05, 0.03),
            translation: Vector3::new(0.2, -0.1, 0.3),
            scale: 1.5,
        }
    }

    #[test]
    fn test_refine_recovers_scale() {
        let truth = truth();
        let correspondences = scene(&truth);
        let initial = Sim3 {
            scale: 1.45,
            translation: truth.translation + Vector3::new(0.02, 0.0, -0.02),
            ..truth
        };
        let result = optimize_sim3(
            &correspondences,
            &camera(),
            &camera(),
            &initial,
            false,
            &Sim3RefineConfig::default(),
        )
        .unwrap();

        assert_eq!(result.num_inliers, correspondences.len());
        assert_relative_eq!(result.s12.scale, truth.scale, epsilon = 1e-3);
        assert_relative_eq!(result.s12.translation, truth.translation, epsilon = 1e-3);
    }

    #[test]
    fn test_refine_drops_outliers() {
        let truth = truth();
        let mut correspondences = scene(&truth);
        for c in correspondences.iter_mut().take(4) {
            c.uv1 += Vector2::new(40.0, -35.0);
        }
        let result = optimize_sim3(
            &correspondences,
            &camera(),
            &camera(),
            &truth,
            false,
            &Sim3RefineConfig::default(),
        )
        .unwrap();

        assert!(result.inliers[..4].iter().all(|i| !i));
        assert_eq!(result.num_inliers, correspondences.len() - 4);
        assert_relative_eq!(result.s12.scale, truth.scale, epsilon = 1e-2);
    }

    #[test]
    fn test_fixed_scale_is_preserved() {
        let truth = Sim3 { scale: 1.0, ..truth() };
        let correspondences = scene(&truth);
        let result = optimize_sim3(
            &correspondences,
            &camera(),
            &camera(),
            &truth,
            true,
            &Sim3RefineConfig::default(),
        )
        .unwrap();
        assert_relative_eq!(result.s12.scale, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_too_few_correspondences() {
        let correspondences: Vec<_> = scene(&truth()).into_iter().take(1).collect();
        assert!(optimize_sim3(
            &correspondences,
            &camera(),
            &camera(),
            &truth(),
            false,
            &Sim3RefineConfig::default(),
        )
        .is_none());
    }
}
