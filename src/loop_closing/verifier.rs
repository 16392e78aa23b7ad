//! Geometric verification of loop candidates.
//!
//! A candidate pair is accepted in stages:
//! 1. enough BoW matches between the two keyframes,
//! 2. a Sim3 RANSAC hypothesis, extended by guided matching and refined,
//! 3. (local loops only) enough matches when the candidate neighbourhood is
//!    projected into the current keyframe under the corrected pose.

use serde::{Deserialize, Serialize};

use crate::atlas::map::{KeyFrameId, KeyFrameSnapshot, LandmarkSnapshot, Map, MapPointId};
use crate::geometry::Sim3;
use crate::matching::{search_by_bow, search_by_projection, search_by_sim3, MatcherConfig};
use crate::optimizer::{optimize_sim3, Sim3RefineConfig};

use super::sim3_solver::{matched_pairs, Sim3Solver, Sim3SolverConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// BoW matches needed before RANSAC is attempted.
    pub min_bow_matches: usize,
    /// Inliers needed after Sim3 refinement.
    pub min_refined_inliers: usize,
    /// Matches needed after projecting the candidate neighbourhood.
    pub min_total_matches: usize,
    /// Search radius (pixels at level 0) for guided Sim3 matching.
    pub sim3_search_radius: f64,
    /// Search radius for the final projection stage.
    pub projection_radius: f64,
    pub refine: Sim3RefineConfig,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            min_bow_matches: 20,
            min_refined_inliers: 20,
            min_total_matches: 40,
            sim3_search_radius: 7.5,
            projection_radius: 10.0,
            refine: Sim3RefineConfig::default(),
        }
    }
}

/// A loop that passed every verification stage.
#[derive(Debug, Clone)]
pub struct AcceptedLoop {
    pub current_kf: KeyFrameId,
    pub loop_kf: KeyFrameId,
    /// Similarity mapping loop-camera coordinates into current-camera ones.
    pub s12: Sim3,
    /// Corrected camera-from-world pose of the current keyframe.
    pub scw: Sim3,
    /// Per feature of the current keyframe, the loop landmark it matched.
    pub current_matched_points: Vec<Option<MapPointId>>,
    /// Landmarks of the loop keyframe and its covisibles.
    pub loop_map_points: Vec<MapPointId>,
    pub num_inliers: usize,
}

impl AcceptedLoop {
    pub fn num_matches(&self) -> usize {
        self.current_matched_points.iter().flatten().count()
    }
}

/// A verified match between a remote keyframe and a local one.
#[derive(Debug, Clone)]
pub struct RemoteLoop {
    pub remote_kf: KeyFrameId,
    pub local_kf: KeyFrameId,
    /// Similarity mapping local-camera coordinates into remote-camera ones.
    pub s12: Sim3,
    pub num_inliers: usize,
}

/// Output of the first two stages for one keyframe pair.
struct Sim3Estimate {
    s12: Sim3,
    matches12: Vec<Option<usize>>,
    num_inliers: usize,
}

#[derive(Debug, Clone)]
pub struct GeometricVerifier {
    matcher: MatcherConfig,
    solver: Sim3SolverConfig,
    config: VerifierConfig,
    fix_scale: bool,
}

impl GeometricVerifier {
    pub fn new(
        matcher: MatcherConfig,
        solver: Sim3SolverConfig,
        config: VerifierConfig,
        fix_scale: bool,
    ) -> Self {
        Self {
            matcher,
            solver,
            config,
            fix_scale,
        }
    }

    pub fn fix_scale(&self) -> bool {
        self.fix_scale
    }

    /// Verify `candidates` against the current keyframe, in order.
    ///
    /// The first candidate that yields a refined Sim3 is the only one taken
    /// to the projection stage; if that stage fails, the pass yields nothing.
    pub fn verify_local(
        &self,
        map: &Map,
        current: KeyFrameId,
        candidates: &[KeyFrameId],
    ) -> Option<AcceptedLoop> {
        let current_snap = map.snapshot_keyframe(current)?;

        let (loop_snap, estimate) = candidates
            .iter()
            .filter(|&&id| id != current)
            .filter_map(|&id| map.snapshot_keyframe(id))
            .find_map(|candidate| {
                let estimate = self.estimate(&current_snap, &candidate)?;
                Some((candidate, estimate))
            })?;

        // Corrected pose of the current keyframe seen from the loop side.
        let scw = estimate
            .s12
            .compose(&Sim3::from_se3(&loop_snap.pose_cw()));

        let mut loop_group: Vec<KeyFrameId> = map
            .get_keyframe(loop_snap.id)
            .map(|kf| kf.ordered_covisibles().into_iter().map(|(id, _)| id).collect())
            .unwrap_or_default();
        loop_group.insert(0, loop_snap.id);

        let loop_map_points = map.get_map_points_from_keyframes(&loop_group);
        let loop_landmarks: Vec<LandmarkSnapshot> = loop_map_points
            .iter()
            .filter_map(|&mp| map.landmark_snapshot(mp))
            .collect();

        let mut current_matched_points: Vec<Option<MapPointId>> = estimate
            .matches12
            .iter()
            .map(|m| m.and_then(|i2| loop_snap.landmark(i2).map(|lm| lm.id)))
            .collect();

        search_by_projection(
            &current_snap,
            &scw,
            &loop_landmarks,
            &mut current_matched_points,
            self.config.projection_radius,
        );

        let total = current_matched_points.iter().flatten().count();
        if total < self.config.min_total_matches {
            tracing::debug!(
                current = %current,
                candidate = %loop_snap.id,
                total,
                "loop rejected after projection"
            );
            return None;
        }

        tracing::info!(
            current = %current,
            loop_kf = %loop_snap.id,
            inliers = estimate.num_inliers,
            matches = total,
            scale = estimate.s12.scale,
            "loop accepted"
        );

        Some(AcceptedLoop {
            current_kf: current,
            loop_kf: loop_snap.id,
            s12: estimate.s12,
            scw,
            current_matched_points,
            loop_map_points,
            num_inliers: estimate.num_inliers,
        })
    }

    /// Verify a remote keyframe against local `candidates`.
    ///
    /// The remote keyframe has no neighbourhood in this map, so only the
    /// first two stages apply.
    pub fn verify_remote(
        &self,
        map: &Map,
        remote: &KeyFrameSnapshot,
        candidates: &[KeyFrameId],
    ) -> Option<RemoteLoop> {
        candidates.iter().find_map(|&id| {
            let local = map.snapshot_keyframe(id)?;
            let estimate = self.estimate(remote, &local)?;
            tracing::info!(
                remote_kf = %remote.id,
                local_kf = %id,
                inliers = estimate.num_inliers,
                scale = estimate.s12.scale,
                "inter-robot loop accepted"
            );
            Some(RemoteLoop {
                remote_kf: remote.id,
                local_kf: id,
                s12: estimate.s12,
                num_inliers: estimate.num_inliers,
            })
        })
    }

    /// BoW matching, RANSAC, guided matching and refinement.
    fn estimate(&self, kf1: &KeyFrameSnapshot, kf2: &KeyFrameSnapshot) -> Option<Sim3Estimate> {
        let matches = search_by_bow(kf1, kf2, &self.matcher);
        let num_bow = matches.iter().flatten().count();
        if num_bow < self.config.min_bow_matches {
            tracing::trace!(kf1 = %kf1.id, kf2 = %kf2.id, num_bow, "too few BoW matches");
            return None;
        }

        let solver = Sim3Solver::new(kf1, kf2, &matches, self.fix_scale, &self.solver);
        let Some(ransac) = solver.solve() else {
            tracing::debug!(kf1 = %kf1.id, kf2 = %kf2.id, num_bow, "Sim3 RANSAC failed");
            return None;
        };

        let mut guided: Vec<Option<usize>> = matches
            .iter()
            .zip(&ransac.inliers)
            .map(|(m, &inlier)| if inlier { *m } else { None })
            .collect();
        search_by_sim3(kf1, kf2, &mut guided, &ransac.s12, self.config.sim3_search_radius);

        let pairs = matched_pairs(kf1, kf2, &guided);
        let correspondences: Vec<_> = pairs.iter().map(|p| p.correspondence).collect();
        let refined = optimize_sim3(
            &correspondences,
            &kf1.camera,
            &kf2.camera,
            &ransac.s12,
            self.fix_scale,
            &self.config.refine,
        )?;

        if refined.num_inliers < self.config.min_refined_inliers {
            tracing::debug!(
                kf1 = %kf1.id,
                kf2 = %kf2.id,
                inliers = refined.num_inliers,
                "too few inliers after Sim3 refinement"
            );
            return None;
        }

        let s12 = refined.s12.renormalize()?;

        let mut matches12 = vec![None; kf1.num_features()];
        for (pair, &inlier) in pairs.iter().zip(&refined.inliers) {
            if inlier {
                matches12[pair.feature1] = Some(pair.feature2);
            }
        }

        Some(Sim3Estimate {
            s12,
            matches12,
            num_inliers: refined.num_inliers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = VerifierConfig::default();
        assert_eq!(config.min_bow_matches, 20);
        assert_eq!(config.min_refined_inliers, 20);
        assert_eq!(config.min_total_matches, 40);
    }

    #[test]
    fn test_unknown_keyframe_is_rejected() {
        let verifier = GeometricVerifier::new(
            MatcherConfig::default(),
            Sim3SolverConfig::default(),
            VerifierConfig::default(),
            false,
        );
        let map = Map::new();
        assert!(verifier
            .verify_local(&map, KeyFrameId::new(3), &[KeyFrameId::new(1)])
            .is_none());
    }
}
