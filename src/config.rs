//! Engine configuration loaded from YAML.
//!
//! Every section has defaults, so a file only needs the values it changes:
//!
//! ```yaml
//! fix_scale: false
//! detector:
//!   consistency_threshold: 3
//! exchange:
//!   robot_id: 1
//!   robot_symbol: b
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LoopClosingError, Result};
use crate::exchange::ExchangeConfig;
use crate::loop_closing::{CorrectorConfig, DetectorConfig, Sim3SolverConfig, VerifierConfig};
use crate::matching::MatcherConfig;
use crate::optimizer::{EssentialGraphConfig, GlobalBAConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosingConfig {
    /// Keep Sim3 scale at 1 (stereo / RGB-D).
    pub fix_scale: bool,
    /// Vocabulary levels above the leaves used for the feature vector.
    pub bow_levels_up: usize,
    /// How long a correction waits for mapping to acknowledge a pause.
    pub mapping_pause_timeout_ms: u64,

    pub detector: DetectorConfig,
    pub matcher: MatcherConfig,
    pub sim3_solver: Sim3SolverConfig,
    pub verifier: VerifierConfig,
    pub corrector: CorrectorConfig,
    pub essential_graph: EssentialGraphConfig,
    pub global_ba: GlobalBAConfig,
    pub exchange: ExchangeConfig,
}

impl Default for LoopClosingConfig {
    fn default() -> Self {
        Self {
            fix_scale: false,
            bow_levels_up: 4,
            mapping_pause_timeout_ms: 5000,
            detector: DetectorConfig::default(),
            matcher: MatcherConfig::default(),
            sim3_solver: Sim3SolverConfig::default(),
            verifier: VerifierConfig::default(),
            corrector: CorrectorConfig::default(),
            essential_graph: EssentialGraphConfig::default(),
            global_ba: GlobalBAConfig::default(),
            exchange: ExchangeConfig::default(),
        }
    }
}

impl LoopClosingConfig {
    /// Load and validate a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, what: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(LoopClosingError::Config(what.to_string()))
            }
        }

        check(
            self.detector.consistency_threshold > 0,
            "detector.consistency_threshold must be positive",
        )?;
        check(
            self.matcher.nn_ratio > 0.0 && self.matcher.nn_ratio <= 1.0,
            "matcher.nn_ratio must be in (0, 1]",
        )?;
        check(
            self.sim3_solver.max_iterations > 0,
            "sim3_solver.max_iterations must be positive",
        )?;
        check(
            self.sim3_solver.min_inliers >= 3,
            "sim3_solver.min_inliers must be at least 3",
        )?;
        check(
            self.sim3_solver.probability > 0.0 && self.sim3_solver.probability < 1.0,
            "sim3_solver.probability must be in (0, 1)",
        )?;
        check(
            self.sim3_solver.chi2_threshold > 0.0,
            "sim3_solver.chi2_threshold must be positive",
        )?;
        check(
            self.verifier.sim3_search_radius > 0.0 && self.verifier.projection_radius > 0.0,
            "verifier search radii must be positive",
        )?;
        check(
            self.corrector.fuse_radius > 0.0,
            "corrector.fuse_radius must be positive",
        )?;
        check(
            self.exchange.remote_consistency_threshold > 0,
            "exchange.remote_consistency_threshold must be positive",
        )?;
        check(
            (0.0..=1.0).contains(&self.exchange.remote_min_score),
            "exchange.remote_min_score must be in [0, 1]",
        )?;
        check(
            self.exchange.robot_symbol.is_ascii_alphabetic(),
            "exchange.robot_symbol must be an ASCII letter",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(LoopClosingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = LoopClosingConfig::from_yaml(
            "fix_scale: true\ndetector:\n  consistency_threshold: 4\n",
        )
        .unwrap();
        assert!(config.fix_scale);
        assert_eq!(config.detector.consistency_threshold, 4);
        assert_eq!(config.detector.min_keyframes_since_loop, 10);
        assert_eq!(config.verifier.min_total_matches, 40);
        assert_eq!(config.bow_levels_up, 4);
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let err = LoopClosingConfig::from_yaml("detector:\n  consistency_threshold: 0\n");
        assert!(matches!(err, Err(LoopClosingError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let mut config = LoopClosingConfig::default();
        config.matcher.nn_ratio = 1.5;
        assert!(config.validate().is_err());
    }
}
