//! Essential Graph optimization after a loop correction.
//!
//! The graph holds every keyframe of the map as a Sim3 vertex (camera to
//! world) and three kinds of edges: spanning tree, existing loop edges and
//! strong covisibility. Their measurements are relative poses taken before
//! the loop correction. The new loop connections use corrected poses
//! instead, so the solver distributes the loop error along the graph.
//!
//! Three phases:
//! 1. COLLECT: vertices and edges from the map (under the map lock)
//! 2. SOLVE: LM over the Sim3 tangent of every non-fixed vertex
//! 3. APPLY: write poses back and move each landmark with its reference

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::geometry::Sim3;

/// Sim3 pose per keyframe, camera to world.
pub type KeyFrameAndPose = HashMap<KeyFrameId, Sim3>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EssentialGraphConfig {
    pub max_iterations: usize,
    pub param_tolerance: f64,
    pub gradient_tolerance: f64,
    /// Minimum covisibility weight for a covisibility edge.
    pub min_covisibility_weight: usize,
}

impl Default for EssentialGraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            min_covisibility_weight: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    SpanningTree,
    /// Loop edge registered by an earlier loop closure.
    Loop,
    Covisibility,
    /// Connection created by the loop being closed.
    NewLoop,
}

#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub kf_i: KeyFrameId,
    pub kf_j: KeyFrameId,
    /// S_ij = S_wi^-1 * S_wj
    pub measurement: Sim3,
    pub edge_type: EdgeType,
}

/// Everything the loop corrector knows about the loop being closed.
pub struct LoopCorrectionInput<'a> {
    pub loop_kf: KeyFrameId,
    pub current_kf: KeyFrameId,
    /// Poses of the current connected group before correction.
    pub non_corrected: &'a KeyFrameAndPose,
    /// Poses of the current connected group after Sim3 propagation.
    pub corrected: &'a KeyFrameAndPose,
    pub loop_connections: &'a HashMap<KeyFrameId, HashSet<KeyFrameId>>,
    /// Landmarks moved by the correction, with the keyframe that moved them.
    pub corrected_points: &'a HashMap<MapPointId, KeyFrameId>,
    pub fix_scale: bool,
}

pub struct EssentialGraphProblem {
    pub kf_ids: Vec<KeyFrameId>,
    /// Vertex estimates before optimization.
    pub initial_poses: KeyFrameAndPose,
    pub edges: Vec<GraphEdge>,
    pub fixed_kf_id: KeyFrameId,
    pub fix_scale: bool,
}

#[derive(Debug)]
pub struct EssentialGraphResult {
    pub optimized_poses: KeyFrameAndPose,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// PHASE 1: Collect vertices and edges.
pub fn collect_essential_graph(
    map: &Map,
    input: &LoopCorrectionInput<'_>,
    config: &EssentialGraphConfig,
) -> Option<EssentialGraphProblem> {
    let mut kf_ids: Vec<KeyFrameId> = map
        .keyframes()
        .filter(|kf| !kf.is_bad)
        .map(|kf| kf.id)
        .collect();
    kf_ids.sort();
    map.get_keyframe(input.loop_kf)?;

    let initial_poses: KeyFrameAndPose = kf_ids
        .iter()
        .filter_map(|&id| {
            let pose = input
                .corrected
                .get(&id)
                .copied()
                .or_else(|| map.get_keyframe(id).map(|kf| Sim3::from_se3(&kf.pose)))?;
            Some((id, pose))
        })
        .collect();

    // Pose before the correction, used by every edge except the new loop ones.
    let original = |id: KeyFrameId| -> Option<Sim3> {
        input
            .non_corrected
            .get(&id)
            .copied()
            .or_else(|| map.get_keyframe(id).map(|kf| Sim3::from_se3(&kf.pose)))
    };
    let relative = |a: &Sim3, b: &Sim3| a.inverse().compose(b);

    let mut edges = Vec::new();
    let mut inserted: HashSet<(KeyFrameId, KeyFrameId)> = HashSet::new();
    let key = |a: KeyFrameId, b: KeyFrameId| (a.min(b), a.max(b));

    for (&kf_i, connections) in input.loop_connections {
        let Some(s_wi) = initial_poses.get(&kf_i) else {
            continue;
        };
        for &kf_j in connections {
            let is_main_loop = kf_i == input.current_kf && kf_j == input.loop_kf;
            let weight = map
                .get_keyframe(kf_i)
                .map_or(0, |kf| kf.get_covisibility_weight(kf_j));
            if !is_main_loop && weight < config.min_covisibility_weight {
                continue;
            }
            let Some(s_wj) = initial_poses.get(&kf_j) else {
                continue;
            };
            if inserted.insert(key(kf_i, kf_j)) {
                edges.push(GraphEdge {
                    kf_i,
                    kf_j,
                    measurement: relative(s_wi, s_wj),
                    edge_type: EdgeType::NewLoop,
                });
            }
        }
    }

    for &kf_id in &kf_ids {
        let Some(kf) = map.get_keyframe(kf_id) else {
            continue;
        };
        let Some(s_wi) = original(kf_id) else {
            continue;
        };

        let mut push = |other: KeyFrameId, edge_type: EdgeType| {
            if !initial_poses.contains_key(&other) || !inserted.insert(key(kf_id, other)) {
                return;
            }
            if let Some(s_wj) = original(other) {
                edges.push(GraphEdge {
                    kf_i: other,
                    kf_j: kf_id,
                    measurement: relative(&s_wj, &s_wi),
                    edge_type,
                });
            }
        };

        if let Some(parent) = kf.parent_id {
            push(parent, EdgeType::SpanningTree);
        }
        for &other in kf.loop_edges() {
            if other < kf_id {
                push(other, EdgeType::Loop);
            }
        }
        for other in kf.get_covisibles_above_weight(config.min_covisibility_weight) {
            let is_tree = kf.parent_id == Some(other) || kf.children_ids.contains(&other);
            if other < kf_id && !is_tree {
                push(other, EdgeType::Covisibility);
            }
        }
    }

    Some(EssentialGraphProblem {
        kf_ids,
        initial_poses,
        edges,
        fixed_kf_id: input.loop_kf,
        fix_scale: input.fix_scale,
    })
}

/// PHASE 2: Solve with damped Gauss-Newton on the Sim3 tangent.
pub fn solve_essential_graph(
    problem: &EssentialGraphProblem,
    config: &EssentialGraphConfig,
) -> Option<EssentialGraphResult> {
    let dof = if problem.fix_scale { 6 } else { 7 };

    let mut param_of: HashMap<KeyFrameId, usize> = HashMap::new();
    for &id in &problem.kf_ids {
        if id != problem.fixed_kf_id && problem.initial_poses.contains_key(&id) {
            let next = param_of.len();
            param_of.insert(id, next);
        }
    }
    let n_params = param_of.len() * dof;
    if n_params == 0 || problem.edges.is_empty() {
        return None;
    }

    let fixed_pose = *problem.initial_poses.get(&problem.fixed_kf_id)?;
    let graph = GraphView {
        problem,
        param_of: &param_of,
        fixed_pose,
        dof,
    };

    let mut params = DVector::zeros(n_params);
    for (id, &idx) in &param_of {
        let tangent = problem.initial_poses[id].log();
        for k in 0..dof {
            params[idx * dof + k] = tangent[k];
        }
    }

    let initial_error = graph.error(&params);
    let mut current_error = initial_error;
    let mut lambda = 1e-3;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;
        let (residuals, jacobian) = graph.linearize(&params);
        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < config.gradient_tolerance {
            break;
        }

        let mut damped = jacobian.transpose() * &jacobian;
        for i in 0..n_params {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }
        let Some(delta) = damped.lu().solve(&(-&gradient)) else {
            break;
        };
        if delta.norm() < config.param_tolerance * (params.norm() + config.param_tolerance) {
            break;
        }

        let trial = &params + &delta;
        let trial_error = graph.error(&trial);
        if trial_error < current_error {
            params = trial;
            current_error = trial_error;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    let mut optimized_poses = KeyFrameAndPose::new();
    optimized_poses.insert(problem.fixed_kf_id, fixed_pose);
    for (&id, &idx) in &param_of {
        optimized_poses.insert(id, graph.pose(&params, Some(idx)));
    }

    Some(EssentialGraphResult {
        optimized_poses,
        iterations,
        initial_error: initial_error.sqrt(),
        final_error: current_error.sqrt(),
    })
}

/// PHASE 3: Apply optimized poses and move landmarks with their reference
/// keyframe: `P' = S_wr_opt * S_wr_before^-1 * P`.
pub fn apply_essential_graph(
    map: &mut Map,
    problem: &EssentialGraphProblem,
    result: &EssentialGraphResult,
    corrected_points: &HashMap<MapPointId, KeyFrameId>,
) -> usize {
    let mut moved = Vec::new();
    for mp in map.map_points() {
        if mp.is_bad {
            continue;
        }
        let reference = corrected_points.get(&mp.id).copied().unwrap_or(mp.ref_kf_id);
        let (Some(before), Some(after)) = (
            problem.initial_poses.get(&reference),
            result.optimized_poses.get(&reference),
        ) else {
            continue;
        };
        let local = before.inverse().transform_point(&mp.position);
        moved.push((mp.id, after.transform_point(&local)));
    }

    let mut updated = 0;
    for (kf_id, pose) in &result.optimized_poses {
        if map.set_keyframe_pose(*kf_id, pose.to_se3()) {
            updated += 1;
        }
    }
    for (mp_id, position) in moved {
        if let Some(mp) = map.get_map_point_mut(mp_id) {
            mp.position = position;
        }
        map.update_normal_and_depth(mp_id);
    }
    updated
}

/// Run all three phases. Returns `None` when there is nothing to optimize.
pub fn optimize_essential_graph(
    map: &mut Map,
    input: &LoopCorrectionInput<'_>,
    config: &EssentialGraphConfig,
) -> Option<EssentialGraphResult> {
    let problem = collect_essential_graph(map, input, config)?;
    let result = solve_essential_graph(&problem, config)?;
    apply_essential_graph(map, &problem, &result, input.corrected_points);
    tracing::debug!(
        vertices = problem.kf_ids.len(),
        edges = problem.edges.len(),
        iterations = result.iterations,
        initial_error = result.initial_error,
        final_error = result.final_error,
        "essential graph optimized"
    );
    Some(result)
}

struct GraphView<'a> {
    problem: &'a EssentialGraphProblem,
    param_of: &'a HashMap<KeyFrameId, usize>,
    fixed_pose: Sim3,
    dof: usize,
}

impl GraphView<'_> {
    fn pose(&self, params: &DVector<f64>, idx: Option<usize>) -> Sim3 {
        let Some(idx) = idx else {
            return self.fixed_pose;
        };
        let mut tangent = [0.0; 7];
        for k in 0..self.dof {
            tangent[k] = params[idx * self.dof + k];
        }
        if self.dof == 6 {
            tangent[6] = 0.0;
        }
        Sim3::exp(&tangent)
    }

    fn edge_residual(&self, edge: &GraphEdge, s_wi: &Sim3, s_wj: &Sim3) -> [f64; 7] {
        edge.measurement
            .inverse()
            .compose(&s_wi.inverse().compose(s_wj))
            .log()
    }

    fn error(&self, params: &DVector<f64>) -> f64 {
        self.problem
            .edges
            .iter()
            .map(|edge| {
                let s_wi = self.pose(params, self.param_of.get(&edge.kf_i).copied());
                let s_wj = self.pose(params, self.param_of.get(&edge.kf_j).copied());
                self.edge_residual(edge, &s_wi, &s_wj)
                    .iter()
                    .take(self.dof)
                    .map(|e| e * e)
                    .sum::<f64>()
            })
            .sum()
    }

    /// Residuals and numerical Jacobian (central differences, per vertex).
    fn linearize(&self, params: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        let dof = self.dof;
        let n_rows = self.problem.edges.len() * dof;
        let mut residuals = DVector::zeros(n_rows);
        let mut jacobian = DMatrix::zeros(n_rows, params.len());
        let eps = 1e-6;

        for (e, edge) in self.problem.edges.iter().enumerate() {
            let idx_i = self.param_of.get(&edge.kf_i).copied();
            let idx_j = self.param_of.get(&edge.kf_j).copied();
            let s_wi = self.pose(params, idx_i);
            let s_wj = self.pose(params, idx_j);
            let r = self.edge_residual(edge, &s_wi, &s_wj);
            for k in 0..dof {
                residuals[e * dof + k] = r[k];
            }

            for (idx, is_i) in [(idx_i, true), (idx_j, false)] {
                let Some(idx) = idx else { continue };
                let base = idx * dof;
                let mut probe = params.clone();
                for p in 0..dof {
                    let orig = probe[base + p];
                    probe[base + p] = orig + eps;
                    let plus = self.pose(&probe, Some(idx));
                    probe[base + p] = orig - eps;
                    let minus = self.pose(&probe, Some(idx));
                    probe[base + p] = orig;

                    let (r_plus, r_minus) = if is_i {
                        (
                            self.edge_residual(edge, &plus, &s_wj),
                            self.edge_residual(edge, &minus, &s_wj),
                        )
                    } else {
                        (
                            self.edge_residual(edge, &s_wi, &plus),
                            self.edge_residual(edge, &s_wi, &minus),
                        )
                    };
                    for k in 0..dof {
                        jacobian[(e * dof + k, base + p)] += (r_plus[k] - r_minus[k]) / (2.0 * eps);
                    }
                }
            }
        }
        (residuals, jacobian)
    }
}
