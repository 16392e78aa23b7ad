//! Global Bundle Adjustment after a loop correction.
//!
//! Refines every keyframe pose and landmark position of the map by
//! minimizing robust reprojection error. The oldest keyframe is held fixed.
//! Landmarks are eliminated with the Schur complement, so only the reduced
//! camera system is solved densely.
//!
//! Runs in the three-phase pattern so the solve holds no lock:
//! 1. COLLECT: copy poses, positions and observations out of the map
//! 2. SOLVE: LM iterations, polling `should_stop` before each one
//! 3. APPLY: write results back, then propagate them to keyframes and
//!    landmarks created while the solve was running

use std::collections::{HashMap, HashSet, VecDeque};

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix2x6, Matrix3, Matrix6x3, Vector2, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::{CameraModel, SE3};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalBAConfig {
    pub max_iterations: usize,
    pub param_tolerance: f64,
    pub gradient_tolerance: f64,
    /// Huber kernel width on the whitened error (pixels at level 0).
    pub huber_threshold: f64,
}

impl Default for GlobalBAConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            huber_threshold: 5.991_f64.sqrt(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalBAObservation {
    pub kf_id: KeyFrameId,
    pub mp_id: MapPointId,
    pub observed_uv: Vector2<f64>,
    pub inv_sigma2: f64,
}

pub struct GlobalBAProblem {
    /// T_cw per keyframe.
    pub kf_poses: HashMap<KeyFrameId, SE3>,
    pub cameras: HashMap<KeyFrameId, CameraModel>,
    pub mp_positions: HashMap<MapPointId, Vector3<f64>>,
    pub observations: Vec<GlobalBAObservation>,
    pub kf_ids: Vec<KeyFrameId>,
    pub mp_ids: Vec<MapPointId>,
    pub fixed_kf_id: KeyFrameId,
}

#[derive(Debug, Clone)]
pub struct GlobalBAResult {
    /// Optimized T_wc.
    pub optimized_poses: HashMap<KeyFrameId, SE3>,
    pub optimized_points: HashMap<MapPointId, Vector3<f64>>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// PHASE 1: Collect all good keyframes, landmarks and observations.
pub fn collect_global_ba_data(map: &Map) -> Option<GlobalBAProblem> {
    let mut kf_ids: Vec<KeyFrameId> = map
        .keyframes()
        .filter(|kf| !kf.is_bad)
        .map(|kf| kf.id)
        .collect();
    if kf_ids.is_empty() {
        return None;
    }
    kf_ids.sort();
    let fixed_kf_id = map
        .origin_keyframe_id()
        .filter(|id| kf_ids.contains(id))
        .unwrap_or(kf_ids[0]);

    let mut kf_poses = HashMap::new();
    let mut cameras = HashMap::new();
    let mut observations = Vec::new();
    let mut seen_points = HashSet::new();

    for &kf_id in &kf_ids {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        kf_poses.insert(kf_id, kf.pose_cw());
        cameras.insert(kf_id, kf.camera);
        for (idx, mp_id) in kf.get_map_point_indices() {
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };
            if mp.is_bad {
                continue;
            }
            let Some(kp) = kf.keypoints.get(idx) else {
                continue;
            };
            seen_points.insert(mp_id);
            observations.push(GlobalBAObservation {
                kf_id,
                mp_id,
                observed_uv: Vector2::new(kp.x, kp.y),
                inv_sigma2: kf.pyramid.inv_sigma2(kp.octave),
            });
        }
    }
    if observations.is_empty() {
        return None;
    }

    let mut mp_ids: Vec<MapPointId> = seen_points.into_iter().collect();
    mp_ids.sort();
    let mp_positions = mp_ids
        .iter()
        .filter_map(|&id| map.get_map_point(id).map(|mp| (id, mp.position)))
        .collect();

    Some(GlobalBAProblem {
        kf_poses,
        cameras,
        mp_positions,
        observations,
        kf_ids,
        mp_ids,
        fixed_kf_id,
    })
}

/// Current estimate during the solve.
#[derive(Clone)]
struct Estimate {
    poses: Vec<SE3>,
    points: Vec<Vector3<f64>>,
}

struct Indexed<'a> {
    problem: &'a GlobalBAProblem,
    config: &'a GlobalBAConfig,
    kf_index: HashMap<KeyFrameId, usize>,
    mp_index: HashMap<MapPointId, usize>,
    /// Parameter block of each keyframe, `None` for the fixed one.
    pose_param: Vec<Option<usize>>,
    n_pose_params: usize,
}

impl Indexed<'_> {
    fn huber_cost(&self, chi2: f64) -> f64 {
        let delta = self.config.huber_threshold;
        if chi2 <= delta * delta {
            chi2
        } else {
            2.0 * delta * chi2.sqrt() - delta * delta
        }
    }

    fn huber_weight(&self, chi2: f64) -> f64 {
        let delta = self.config.huber_threshold;
        let e = chi2.sqrt();
        if e <= delta {
            1.0
        } else {
            delta / e
        }
    }

    /// Error of one observation, or `None` if the point is behind the camera.
    fn residual(&self, est: &Estimate, obs: &GlobalBAObservation) -> Option<(Vector2<f64>, Vector3<f64>, usize, usize)> {
        let k = *self.kf_index.get(&obs.kf_id)?;
        let m = *self.mp_index.get(&obs.mp_id)?;
        let camera = self.problem.cameras.get(&obs.kf_id)?;
        let p_cam = est.poses[k].transform_point(&est.points[m]);
        let uv = camera.project(&p_cam)?;
        Some((obs.observed_uv - uv, p_cam, k, m))
    }

    fn cost(&self, est: &Estimate) -> f64 {
        self.problem
            .observations
            .iter()
            .filter_map(|obs| {
                let (e, ..) = self.residual(est, obs)?;
                Some(self.huber_cost(e.norm_squared() * obs.inv_sigma2))
            })
            .sum()
    }

    /// One damped Gauss-Newton step through the Schur complement.
    fn step(&self, est: &Estimate, lambda: f64) -> Option<(DVector<f64>, Vec<Vector3<f64>>, f64)> {
        let n_points = est.points.len();
        let np = self.n_pose_params;
        let mut h_pp = DMatrix::<f64>::zeros(np, np);
        let mut b_p = DVector::<f64>::zeros(np);
        let mut h_xx = vec![Matrix3::<f64>::zeros(); n_points];
        let mut b_x = vec![Vector3::<f64>::zeros(); n_points];
        let mut h_px: Vec<Vec<(usize, Matrix6x3<f64>)>> = vec![Vec::new(); n_points];

        for obs in &self.problem.observations {
            let Some((e, p_cam, k, m)) = self.residual(est, obs) else {
                continue;
            };
            let Some(camera) = self.problem.cameras.get(&obs.kf_id) else {
                continue;
            };
            let chi2 = e.norm_squared() * obs.inv_sigma2;
            let info = obs.inv_sigma2 * self.huber_weight(chi2);

            let j_x = jacobian_point(&est.poses[k], &p_cam, camera);
            h_xx[m] += j_x.transpose() * j_x * info;
            b_x[m] += j_x.transpose() * e * info;

            if let Some(block) = self.pose_param[k] {
                let j_p = jacobian_pose(&p_cam, camera);
                let o = block * 6;
                let hpp = j_p.transpose() * j_p * info;
                let mut view = h_pp.fixed_view_mut::<6, 6>(o, o);
                view += hpp;
                let bp: Vector6<f64> = j_p.transpose() * e * info;
                let mut bview = b_p.fixed_rows_mut::<6>(o);
                bview += bp;
                h_px[m].push((block, j_p.transpose() * j_x * info));
            }
        }

        let gradient = b_p.norm_squared() + b_x.iter().map(|b| b.norm_squared()).sum::<f64>();

        for i in 0..np {
            h_pp[(i, i)] += lambda * h_pp[(i, i)].max(1e-6);
        }
        let mut h_xx_inv = Vec::with_capacity(n_points);
        for h in &mut h_xx {
            for i in 0..3 {
                h[(i, i)] += lambda * h[(i, i)].max(1e-6);
            }
            h_xx_inv.push(h.try_inverse());
        }

        // Reduced camera system: (Hpp - W Hxx^-1 W^T) dp = -bp + W Hxx^-1 bx
        let mut schur = h_pp;
        let mut rhs = -b_p;
        for m in 0..n_points {
            let Some(inv) = h_xx_inv[m] else { continue };
            for &(a, w_a) in &h_px[m] {
                let w_inv = w_a * inv;
                let mut r = rhs.fixed_rows_mut::<6>(a * 6);
                r += w_inv * b_x[m];
                for &(b, w_b) in &h_px[m] {
                    let mut s = schur.fixed_view_mut::<6, 6>(a * 6, b * 6);
                    s -= w_inv * w_b.transpose();
                }
            }
        }

        let delta_p = if np == 0 {
            DVector::zeros(0)
        } else {
            match schur.clone().cholesky() {
                Some(chol) => chol.solve(&rhs),
                None => schur.lu().solve(&rhs)?,
            }
        };

        let delta_x = (0..n_points)
            .map(|m| {
                let Some(inv) = h_xx_inv[m] else {
                    return Vector3::zeros();
                };
                let mut r = -b_x[m];
                for &(a, w_a) in &h_px[m] {
                    let dp: Vector6<f64> = delta_p.fixed_rows::<6>(a * 6).into_owned();
                    r -= w_a.transpose() * dp;
                }
                inv * r
            })
            .collect();

        Some((delta_p, delta_x, gradient.sqrt()))
    }

    fn apply(&self, est: &Estimate, delta_p: &DVector<f64>, delta_x: &[Vector3<f64>]) -> Estimate {
        let poses = est
            .poses
            .iter()
            .zip(&self.pose_param)
            .map(|(pose, block)| match block {
                Some(b) => {
                    let o = b * 6;
                    let omega = Vector3::new(delta_p[o], delta_p[o + 1], delta_p[o + 2]);
                    let upsilon = Vector3::new(delta_p[o + 3], delta_p[o + 4], delta_p[o + 5]);
                    pose.left_update(&omega, &upsilon)
                }
                None => *pose,
            })
            .collect();
        let points = est.points.iter().zip(delta_x).map(|(p, d)| p + d).collect();
        Estimate { poses, points }
    }
}

/// PHASE 2: Solve. Returns `None` if `should_stop` fires or the problem is
/// degenerate.
pub fn solve_global_ba(
    problem: &GlobalBAProblem,
    config: &GlobalBAConfig,
    should_stop: &dyn Fn() -> bool,
) -> Option<GlobalBAResult> {
    if problem.kf_ids.is_empty() || problem.mp_ids.is_empty() {
        return None;
    }

    let kf_index: HashMap<KeyFrameId, usize> =
        problem.kf_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let mp_index: HashMap<MapPointId, usize> =
        problem.mp_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let mut next_block = 0;
    let pose_param: Vec<Option<usize>> = problem
        .kf_ids
        .iter()
        .map(|&id| {
            (id != problem.fixed_kf_id).then(|| {
                next_block += 1;
                next_block - 1
            })
        })
        .collect();

    let indexed = Indexed {
        problem,
        config,
        kf_index,
        mp_index,
        pose_param,
        n_pose_params: next_block * 6,
    };

    let mut estimate = Estimate {
        poses: problem
            .kf_ids
            .iter()
            .map(|id| problem.kf_poses.get(id).copied().unwrap_or_default())
            .collect(),
        points: problem
            .mp_ids
            .iter()
            .map(|id| problem.mp_positions.get(id).copied().unwrap_or_else(Vector3::zeros))
            .collect(),
    };

    let initial_error = indexed.cost(&estimate);
    let mut current_error = initial_error;
    let mut lambda = 1e-3;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        if should_stop() {
            tracing::debug!(iteration = iter, "global BA interrupted");
            return None;
        }
        iterations = iter + 1;

        let Some((delta_p, delta_x, gradient)) = indexed.step(&estimate, lambda) else {
            break;
        };
        if gradient < config.gradient_tolerance {
            break;
        }
        let step_norm = (delta_p.norm_squared()
            + delta_x.iter().map(|d| d.norm_squared()).sum::<f64>())
        .sqrt();

        let trial = indexed.apply(&estimate, &delta_p, &delta_x);
        let trial_error = indexed.cost(&trial);
        if trial_error < current_error {
            estimate = trial;
            current_error = trial_error;
            lambda = (lambda * 0.1).max(1e-10);
            if step_norm < config.param_tolerance {
                break;
            }
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    if should_stop() {
        return None;
    }

    let optimized_poses = problem
        .kf_ids
        .iter()
        .zip(&estimate.poses)
        .map(|(&id, pose_cw)| (id, pose_cw.inverse()))
        .collect();
    let optimized_points = problem
        .mp_ids
        .iter()
        .zip(&estimate.points)
        .map(|(&id, p)| (id, *p))
        .collect();

    Some(GlobalBAResult {
        optimized_poses,
        optimized_points,
        iterations,
        initial_error,
        final_error: current_error,
    })
}

/// PHASE 3: Write results to the map.
///
/// Keyframes inserted after the collect phase are moved with their spanning
/// tree parent: `T_wc_child' = T_wc_parent' * T_wc_parent^-1 * T_wc_child`.
/// Landmarks not in the result follow their reference keyframe.
pub fn apply_global_ba_results(map: &mut Map, result: &GlobalBAResult) -> usize {
    let mut new_poses: HashMap<KeyFrameId, SE3> = result.optimized_poses.clone();

    let mut roots: Vec<KeyFrameId> = map
        .keyframes()
        .filter(|kf| kf.parent_id.is_none())
        .map(|kf| kf.id)
        .collect();
    roots.sort();
    let mut queue: VecDeque<KeyFrameId> = roots.into_iter().collect();
    let mut visited: HashSet<KeyFrameId> = queue.iter().copied().collect();
    while let Some(parent_id) = queue.pop_front() {
        let Some(parent) = map.get_keyframe(parent_id) else {
            continue;
        };
        let mut children: Vec<KeyFrameId> = parent.children_ids.iter().copied().collect();
        children.sort();
        for child_id in children {
            if !visited.insert(child_id) {
                continue;
            }
            if !new_poses.contains_key(&child_id) {
                if let (Some(parent_new), Some(child)) =
                    (new_poses.get(&parent_id).copied(), map.get_keyframe(child_id))
                {
                    let rel = parent.pose.inverse().compose(&child.pose);
                    new_poses.insert(child_id, parent_new.compose(&rel));
                }
            }
            queue.push_back(child_id);
        }
    }

    let mut moved_points = Vec::new();
    for mp in map.map_points() {
        if mp.is_bad {
            continue;
        }
        if let Some(p) = result.optimized_points.get(&mp.id) {
            moved_points.push((mp.id, *p));
            continue;
        }
        let (Some(reference), Some(new_pose)) =
            (map.get_keyframe(mp.ref_kf_id), new_poses.get(&mp.ref_kf_id))
        else {
            continue;
        };
        let local = reference.pose.inverse().transform_point(&mp.position);
        moved_points.push((mp.id, new_pose.transform_point(&local)));
    }

    let mut updated = 0;
    for (kf_id, pose) in &new_poses {
        if map.get_keyframe(*kf_id).is_some_and(|kf| !kf.is_bad) && map.set_keyframe_pose(*kf_id, *pose) {
            updated += 1;
        }
    }
    for (mp_id, position) in moved_points {
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = position;
            updated += 1;
        }
        map.update_normal_and_depth(mp_id);
    }
    updated
}

/// d(error)/d(δ) for `T_cw' = exp(δ) T_cw`, δ = [ω, υ], error = observed - projected.
fn jacobian_pose(p_cam: &Vector3<f64>, camera: &CameraModel) -> Matrix2x6<f64> {
    let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
    let invz = 1.0 / z;
    let invz2 = invz * invz;
    let fx = camera.fx;
    let fy = camera.fy;

    Matrix2x6::new(
        x * y * invz2 * fx,
        -(1.0 + x * x * invz2) * fx,
        y * invz * fx,
        -invz * fx,
        0.0,
        x * invz2 * fx,
        (1.0 + y * y * invz2) * fy,
        -x * y * invz2 * fy,
        -x * invz * fy,
        0.0,
        -invz * fy,
        y * invz2 * fy,
    )
}

/// d(error)/d(X) = -1/z * [fx 0 -fx x/z; 0 fy -fy y/z] * R_cw
fn jacobian_point(pose_cw: &SE3, p_cam: &Vector3<f64>, camera: &CameraModel) -> Matrix2x3<f64> {
    let invz = 1.0 / p_cam.z;
    let tmp = Matrix2x3::new(
        camera.fx,
        0.0,
        -camera.fx * p_cam.x * invz,
        0.0,
        camera.fy,
        -camera.fy * p_cam.y * invz,
    );
    (-invz) * tmp * pose_cw.rotation_matrix()
}
