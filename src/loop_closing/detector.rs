//! Loop detection using Bag-of-Words with temporal consistency checking.
//!
//! Every pass queries the keyframe database, expands each hit into its
//! covisibility group and votes those groups against the groups of the
//! previous pass. A candidate is only handed to geometric verification once
//! its group has been seen in enough consecutive passes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::atlas::map::{KeyFrameId, Map};
use crate::atlas::KeyFrameDatabase;
use crate::vocabulary::{BowVector, OrbVocabulary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Consecutive passes a group must be seen in before it is trusted.
    pub consistency_threshold: usize,
    /// Keyframes that must follow a corrected loop (and minimum map size)
    /// before detection runs again.
    pub min_keyframes_since_loop: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            consistency_threshold: 3,
            min_keyframes_since_loop: 10,
        }
    }
}

/// A set of candidate keyframes with its consecutive-hit counter.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistentGroup {
    pub members: HashSet<KeyFrameId>,
    pub counter: usize,
}

/// Votes candidate groups across detection passes.
#[derive(Debug, Clone)]
pub struct ConsistencyTracker {
    threshold: usize,
    groups: Vec<ConsistentGroup>,
}

impl ConsistencyTracker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            groups: Vec::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn groups(&self) -> &[ConsistentGroup] {
        &self.groups
    }

    /// Feed one pass worth of candidates, each with its covisibility group.
    ///
    /// A group intersecting a group of the previous pass continues it with
    /// `counter + 1` and the union of both member sets; every previous group
    /// is continued at most once. A group intersecting nothing starts over at
    /// 1. Returns the candidates whose group reached the threshold.
    pub fn update(&mut self, candidates: Vec<(KeyFrameId, HashSet<KeyFrameId>)>) -> Vec<KeyFrameId> {
        if candidates.is_empty() {
            self.groups.clear();
            return Vec::new();
        }

        let mut continued = vec![false; self.groups.len()];
        let mut next_groups = Vec::new();
        let mut enough = Vec::new();

        for (candidate, members) in candidates {
            let mut promoted = false;
            let mut consistent_for_some = false;

            for (i, previous) in self.groups.iter().enumerate() {
                if members.is_disjoint(&previous.members) {
                    continue;
                }
                consistent_for_some = true;
                let counter = previous.counter + 1;
                if !continued[i] {
                    continued[i] = true;
                    next_groups.push(ConsistentGroup {
                        members: members.union(&previous.members).copied().collect(),
                        counter,
                    });
                }
                if counter >= self.threshold && !promoted {
                    enough.push(candidate);
                    promoted = true;
                }
            }

            if !consistent_for_some {
                if 1 >= self.threshold {
                    enough.push(candidate);
                }
                next_groups.push(ConsistentGroup { members, counter: 1 });
            }
        }

        self.groups = next_groups;
        enough
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

/// Candidate detector state kept between passes.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    tracker: ConsistencyTracker,
    enough_consistent: Vec<KeyFrameId>,
}

impl LoopDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self::with_threshold(config.consistency_threshold)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            tracker: ConsistencyTracker::new(threshold),
            enough_consistent: Vec::new(),
        }
    }

    /// One detection pass.
    ///
    /// Queries `database` for keyframes scoring at least `min_score` against
    /// `bow`, skipping `excluded` (the querying keyframe and its covisibles).
    /// Returns true iff some candidate became consistent enough; the
    /// candidates are then available from [`Self::candidates`].
    pub fn detect_loop(
        &mut self,
        map: &Map,
        database: &KeyFrameDatabase,
        bow: &BowVector,
        excluded: &HashSet<KeyFrameId>,
        min_score: f64,
    ) -> bool {
        self.enough_consistent.clear();

        let hits = database.query(bow, min_score, excluded);
        let groups: Vec<(KeyFrameId, HashSet<KeyFrameId>)> = hits
            .iter()
            .filter(|hit| map.get_keyframe(hit.keyframe_id).is_some_and(|kf| !kf.is_bad))
            .map(|hit| {
                let mut members = map.connected_keyframes(hit.keyframe_id);
                members.insert(hit.keyframe_id);
                (hit.keyframe_id, members)
            })
            .collect();

        self.enough_consistent = self.tracker.update(groups);
        if !self.enough_consistent.is_empty() {
            tracing::debug!(
                candidates = ?self.enough_consistent,
                hits = hits.len(),
                "consistent loop candidates"
            );
        }
        !self.enough_consistent.is_empty()
    }

    pub fn candidates(&self) -> &[KeyFrameId] {
        &self.enough_consistent
    }

    pub fn take_candidates(&mut self) -> Vec<KeyFrameId> {
        std::mem::take(&mut self.enough_consistent)
    }

    pub fn tracker(&self) -> &ConsistencyTracker {
        &self.tracker
    }

    pub fn clear(&mut self) {
        self.tracker.clear();
        self.enough_consistent.clear();
    }
}

/// Lowest BoW score between `bow` and the covisibles of `kf_id`.
///
/// Candidates must look at least as similar as the least similar keyframe
/// that already shares the view. 1.0 when the keyframe has no covisibles.
pub fn compute_min_score(map: &Map, kf_id: KeyFrameId, bow: &BowVector) -> f64 {
    let Some(kf) = map.get_keyframe(kf_id) else {
        return 1.0;
    };
    kf.ordered_covisibles()
        .into_iter()
        .filter_map(|(id, _)| map.get_keyframe(id))
        .filter(|cov| !cov.is_bad)
        .filter_map(|cov| cov.bow_vector().map(|cov_bow| OrbVocabulary::score(bow, cov_bow)))
        .fold(1.0, f64::min)
}
