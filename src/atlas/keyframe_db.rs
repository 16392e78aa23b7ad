//! KeyFrameDatabase - place recognition database.
//!
//! An inverted file (word → keyframes containing it) over the bag-of-words
//! vectors of every processed keyframe. Queries are side-effect free: the
//! database only answers "which keyframes look like this?" with scores.

use std::collections::{HashMap, HashSet};

use crate::atlas::map::KeyFrameId;
use crate::vocabulary::{BowVector, OrbVocabulary};

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
    pub common_words: usize,
}

/// Fraction of the best common-word count a keyframe must reach to be scored.
const MIN_COMMON_WORDS_RATIO: f64 = 0.8;

#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    inverted_file: HashMap<u32, HashSet<KeyFrameId>>,
    entries: HashMap<KeyFrameId, BowVector>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a keyframe entry.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: BowVector) {
        self.erase(kf_id);
        for word in bow.keys() {
            self.inverted_file.entry(*word).or_default().insert(kf_id);
        }
        self.entries.insert(kf_id, bow);
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        if let Some(bow) = self.entries.remove(&kf_id) {
            for word in bow.keys() {
                if let Some(kfs) = self.inverted_file.get_mut(word) {
                    kfs.remove(&kf_id);
                    if kfs.is_empty() {
                        self.inverted_file.remove(word);
                    }
                }
            }
        }
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.entries.contains_key(&kf_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.inverted_file.clear();
        self.entries.clear();
    }

    /// Keyframes sharing words with `query`, scoring at least `min_score`.
    ///
    /// Only keyframes sharing at least 80% of the best common-word count are
    /// scored, and keyframes in `exclude` are never returned. Results are
    /// sorted by decreasing score.
    pub fn query(
        &self,
        query: &BowVector,
        min_score: f64,
        exclude: &HashSet<KeyFrameId>,
    ) -> Vec<Candidate> {
        let mut common: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query.keys() {
            if let Some(kfs) = self.inverted_file.get(word) {
                for kf_id in kfs {
                    if !exclude.contains(kf_id) {
                        *common.entry(*kf_id).or_insert(0) += 1;
                    }
                }
            }
        }

        let Some(&max_common) = common.values().max() else {
            return Vec::new();
        };
        let min_common = (MIN_COMMON_WORDS_RATIO * max_common as f64) as usize;

        let mut candidates: Vec<Candidate> = common
            .into_iter()
            .filter(|(_, n)| *n > min_common || *n == max_common)
            .filter_map(|(kf_id, n)| {
                let score = OrbVocabulary::score(query, self.entries.get(&kf_id)?);
                (score >= min_score).then_some(Candidate {
                    keyframe_id: kf_id,
                    score,
                    common_words: n,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.keyframe_id.cmp(&b.keyframe_id))
        });
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bow(words: &[u32]) -> BowVector {
        let w = 1.0 / words.len() as f64;
        words.iter().map(|&id| (id, w)).collect()
    }

    #[test]
    fn test_query_scores_and_sorts() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(1), bow(&[1, 2, 3, 4]));
        db.add(KeyFrameId::new(2), bow(&[1, 2, 3, 4, 9]));
        db.add(KeyFrameId::new(3), bow(&[7, 8]));

        let hits = db.query(&bow(&[1, 2, 3, 4]), 0.1, &HashSet::new());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].keyframe_id, KeyFrameId::new(1));
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_query_respects_exclusion_and_min_score() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(1), bow(&[1, 2, 3, 4]));
        db.add(KeyFrameId::new(2), bow(&[1, 2, 3, 4]));

        let exclude = HashSet::from([KeyFrameId::new(1)]);
        let hits = db.query(&bow(&[1, 2, 3, 4]), 0.1, &exclude);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].keyframe_id, KeyFrameId::new(2));

        assert!(db.query(&bow(&[1, 5, 6, 7]), 0.5, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_no_hits_is_empty() {
        let db = KeyFrameDatabase::new();
        assert!(db.query(&bow(&[1]), 0.0, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_erase_and_update() {
        let mut db = KeyFrameDatabase::new();
        db.add(KeyFrameId::new(1), bow(&[1, 2]));
        db.add(KeyFrameId::new(1), bow(&[5, 6]));
        assert_eq!(db.len(), 1);
        assert!(db.query(&bow(&[1, 2]), 0.0, &HashSet::new()).is_empty());

        db.erase(KeyFrameId::new(1));
        assert!(db.is_empty());
        assert!(db.query(&bow(&[5, 6]), 0.0, &HashSet::new()).is_empty());
    }
}
