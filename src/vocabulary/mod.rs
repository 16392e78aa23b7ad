//! ORB Vocabulary for Bag-of-Words place recognition.
//!
//! This module implements loading and querying of a DBoW2-format vocabulary tree
//! used both to score place similarity and to restrict descriptor matching to
//! features that fall into the same vocabulary node.
//!
//! # Vocabulary Structure
//!
//! The vocabulary is a hierarchical k-means tree trained on ORB descriptors:
//! - Branching factor k (typically 10)
//! - Depth L levels (typically 5-6)
//! - ~100,000 leaf nodes ("visual words")
//!
//! # Key Types
//!
//! - [`BowVector`]: Histogram of word occurrences with TF-IDF weights (for place recognition)
//! - [`FeatureVector`]: Groups feature indices by vocabulary node (for accelerated matching)
//! - [`OrbVocabulary`]: The vocabulary tree structure with quantization methods

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;

use crate::atlas::map::{descriptor_distance, Descriptor};

/// Bag-of-Words vector: word_id -> TF-IDF weight, L1-normalized.
pub type BowVector = BTreeMap<u32, f64>;

/// Feature vector: node_id -> list of feature indices.
///
/// Ordered by node id so two feature vectors can be walked in lockstep.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

/// Errors that can occur when loading or using vocabulary.
#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("vocabulary I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vocabulary parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("vocabulary has no words")]
    Empty,
}

/// A node in the vocabulary tree.
#[derive(Debug, Clone)]
pub struct VocabNode {
    pub id: u32,
    /// Parent node ID (u32::MAX for root)
    pub parent: u32,
    pub children: Vec<u32>,
    pub descriptor: Descriptor,
    /// IDF weight (non-zero for leaf nodes)
    pub weight: f64,
    pub word_id: Option<u32>,
}

impl VocabNode {
    fn new(id: u32, parent: u32) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word_id: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// ORB Vocabulary tree (DBoW2 format).
#[derive(Debug)]
pub struct OrbVocabulary {
    /// All nodes in the tree (nodes[0] is root)
    nodes: Vec<VocabNode>,
    /// Word ID to node ID mapping (for leaf nodes)
    words: Vec<u32>,
    k: usize,
    l: usize,
}

impl OrbVocabulary {
    /// Load vocabulary from DBoW2 text format.
    ///
    /// # File Format
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf desc[0] desc[1] ... desc[31] weight
    /// ...
    /// ```
    pub fn load_from_text<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse a DBoW2 text vocabulary from any buffered reader.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, VocabularyError> {
        let mut lines = reader.lines();
        let parse_err = |line: usize, message: &str| VocabularyError::Parse {
            line,
            message: message.to_string(),
        };

        let header = lines.next().ok_or_else(|| parse_err(1, "empty vocabulary file"))??;
        let header_parts: Vec<&str> = header.split_whitespace().collect();
        if header_parts.len() < 2 {
            return Err(parse_err(1, "expected: k L [scoring weighting]"));
        }
        let k: usize = header_parts[0].parse().map_err(|_| parse_err(1, "invalid k"))?;
        let l: usize = header_parts[1].parse().map_err(|_| parse_err(1, "invalid L"))?;

        let mut nodes = vec![VocabNode::new(0, u32::MAX)];
        let mut words = Vec::new();

        for (line_idx, line_result) in lines.enumerate() {
            let line_num = line_idx + 2;
            let line = line_result?;
            let parts: Vec<&str> = line.split_whitespace().collect();

            // parent_id is_leaf desc[32] weight
            if parts.len() < 35 {
                continue;
            }

            let parent_id: u32 = parts[0]
                .parse()
                .map_err(|_| parse_err(line_num, "invalid parent id"))?;
            let is_leaf = parts[1] == "1";

            let mut descriptor = [0u8; 32];
            for (i, byte_str) in parts[2..34].iter().enumerate() {
                descriptor[i] = byte_str
                    .parse()
                    .map_err(|_| parse_err(line_num, "invalid descriptor byte"))?;
            }
            let weight: f64 = parts[34]
                .parse()
                .map_err(|_| parse_err(line_num, "invalid weight"))?;

            if parent_id as usize >= nodes.len() {
                return Err(parse_err(line_num, "parent defined after child"));
            }

            let node_id = nodes.len() as u32;
            let mut node = VocabNode::new(node_id, parent_id);
            node.descriptor = descriptor;
            node.weight = weight;
            if is_leaf {
                node.word_id = Some(words.len() as u32);
                words.push(node_id);
            }
            nodes[parent_id as usize].children.push(node_id);
            nodes.push(node);
        }

        if words.is_empty() {
            return Err(VocabularyError::Empty);
        }

        tracing::info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            k,
            l,
            nodes.len(),
            words.len()
        );

        Ok(Self { nodes, words, k, l })
    }

    /// Build a single-level vocabulary whose words are the given descriptors,
    /// all with unit weight. Used by simulations and tests where training a
    /// full tree is pointless.
    pub fn from_words(words: &[Descriptor]) -> Result<Self, VocabularyError> {
        if words.is_empty() {
            return Err(VocabularyError::Empty);
        }
        let mut nodes = vec![VocabNode::new(0, u32::MAX)];
        let mut word_nodes = Vec::with_capacity(words.len());
        for (i, desc) in words.iter().enumerate() {
            let node_id = nodes.len() as u32;
            let mut node = VocabNode::new(node_id, 0);
            node.descriptor = *desc;
            node.weight = 1.0;
            node.word_id = Some(i as u32);
            nodes[0].children.push(node_id);
            word_nodes.push(node_id);
            nodes.push(node);
        }
        Ok(Self {
            nodes,
            words: word_nodes,
            k: words.len(),
            l: 1,
        })
    }

    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Quantize a single descriptor to its leaf word.
    ///
    /// Returns (word_id, leaf_node_id).
    fn transform_descriptor(&self, desc: &Descriptor) -> (u32, u32) {
        let mut node_id = 0usize;

        while let Some((&first, rest)) = self.nodes[node_id].children.split_first() {
            let mut best_child = first;
            let mut best_dist = descriptor_distance(desc, &self.nodes[first as usize].descriptor);
            for &child in rest {
                let dist = descriptor_distance(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best_child = child;
                }
            }
            node_id = best_child as usize;
        }

        let word_id = self.nodes[node_id].word_id.unwrap_or(0);
        (word_id, node_id as u32)
    }

    /// Ancestor `levels_up` levels above a leaf, stopping below the root.
    fn get_parent_at_level(&self, leaf_id: u32, levels_up: usize) -> u32 {
        let mut node_id = leaf_id;
        for _ in 0..levels_up {
            let parent = self.nodes[node_id as usize].parent;
            if parent == u32::MAX || parent == 0 {
                break;
            }
            node_id = parent;
        }
        node_id
    }

    /// Transform descriptors to BowVector and FeatureVector.
    ///
    /// # Arguments
    ///
    /// * `descriptors` - one ORB descriptor per feature
    /// * `levels_up` - levels to go up from the leaf for FeatureVector grouping
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut feat = FeatureVector::new();

        for (i, desc) in descriptors.iter().enumerate() {
            let (word_id, leaf_id) = self.transform_descriptor(desc);
            let weight = self.nodes[leaf_id as usize].weight;
            *bow.entry(word_id).or_insert(0.0) += weight;

            let node_at_level = self.get_parent_at_level(leaf_id, levels_up);
            feat.entry(node_at_level).or_default().push(i);
        }

        let sum: f64 = bow.values().sum();
        if sum > 0.0 {
            for v in bow.values_mut() {
                *v /= sum;
            }
        }

        (bow, feat)
    }

    /// L1 score: 1 - 0.5 * ||v1 - v2||_1, in [0, 1] where 1 means identical.
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff_sum = 0.0;
        for (word_id, w1) in v1 {
            let w2 = v2.get(word_id).copied().unwrap_or(0.0);
            diff_sum += (w1 - w2).abs();
        }
        for (word_id, w2) in v2 {
            if !v1.contains_key(word_id) {
                diff_sum += w2.abs();
            }
        }
        1.0 - 0.5 * diff_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bow_score() {
        let v1 = BowVector::from([(0, 0.5), (1, 0.5)]);
        let v2 = BowVector::from([(0, 0.5), (1, 0.5)]);
        assert_relative_eq!(OrbVocabulary::score(&v1, &v2), 1.0, epsilon = 1e-10);

        let v3 = BowVector::from([(2, 0.5), (3, 0.5)]);
        assert!(OrbVocabulary::score(&v1, &v3) < 0.01);
    }

    #[test]
    fn test_flat_vocabulary_transform() {
        let words = [[0x00u8; 32], [0xFFu8; 32], [0x0Fu8; 32]];
        let vocab = OrbVocabulary::from_words(&words).unwrap();
        assert_eq!(vocab.num_words(), 3);

        let mut noisy = [0xFFu8; 32];
        noisy[0] = 0xFE;
        let (bow, feat) = vocab.transform(&[noisy, [0x00; 32], [0xFF; 32]], 0);

        assert_eq!(bow.len(), 2);
        assert_relative_eq!(bow[&1], 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(bow[&0], 1.0 / 3.0, epsilon = 1e-12);
        // Word 1 is node 2 (node 0 is the root).
        assert_eq!(feat[&2], vec![0, 2]);
    }

    #[test]
    fn test_parse_text_vocabulary() {
        let zeros = vec!["0"; 32].join(" ");
        let ones = vec!["255"; 32].join(" ");
        let text = format!(
            "2 2 0 0\n0 0 {zeros} 0\n0 0 {ones} 0\n1 1 {zeros} 0.5\n1 1 {zeros} 0.7\n2 1 {ones} 1.5\n"
        );
        let vocab = OrbVocabulary::from_reader(text.as_bytes()).unwrap();
        assert_eq!(vocab.params(), (2, 2));
        assert_eq!(vocab.num_nodes(), 6);
        assert_eq!(vocab.num_words(), 3);

        // Grouping one level up lands on the internal node, never the root.
        let (_, feat) = vocab.transform(&[[0xFF; 32]], 5);
        assert_eq!(feat.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(OrbVocabulary::from_words(&[]), Err(VocabularyError::Empty)));
        assert!(OrbVocabulary::from_reader("x y\n".as_bytes()).is_err());
    }

    #[test]
    #[ignore] // Takes ~8 seconds to load the vocabulary
    fn test_load_dbow2_vocabulary() {
        let vocab_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("data/ORBvoc.txt");
        if !vocab_path.exists() {
            return;
        }
        let vocab = OrbVocabulary::load_from_text(&vocab_path).expect("Failed to load vocabulary");
        assert_eq!(vocab.params(), (10, 6));
        assert!(vocab.num_words() > 90_000);
    }
}
