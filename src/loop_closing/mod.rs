//! Loop closing for a collaborative SLAM team.
//!
//! This module detects places seen before, by this robot or by another one,
//! verifies them geometrically and corrects the local map.
//!
//! # Architecture
//!
//! The pipeline consists of:
//! 1. **Intake** (`queue.rs`): keyframes handed over by mapping
//! 2. **Detection** (`detector.rs`): BoW candidates voted on across passes
//! 3. **Verification** (`sim3_solver.rs`, `verifier.rs`): Sim3 RANSAC,
//!    refinement and projection
//! 4. **Correction** (`corrector.rs`): pose propagation, landmark fusion and
//!    Essential Graph optimization
//! 5. **Refinement** (`global_refinement.rs`): cancellable background Global BA
//! 6. **Thread** (`loop_closer.rs`): the engine handle and its processing loop
//!
//! Remote keyframes enter through [`crate::exchange`] and reuse detection and
//! verification.
//!
//! # Threading Model
//!
//! Detection and verification hold read locks only. A correction pauses
//! mapping and takes the map write lock for its whole duration. Global BA
//! follows the three-phase pattern:
//! - Phase 1 (COLLECT): Read lock to gather data
//! - Phase 2 (SOLVE): No lock, pure computation
//! - Phase 3 (APPLY): Write lock to update the map

pub mod corrector;
pub mod detector;
pub mod global_refinement;
pub mod lifecycle;
pub mod loop_closer;
pub mod queue;
pub mod sim3_solver;
pub mod verifier;

pub use corrector::{propagate_correction, search_and_fuse, CorrectionOutcome, CorrectorConfig, LoopCorrector};
pub use detector::{compute_min_score, ConsistencyTracker, ConsistentGroup, DetectorConfig, LoopDetector};
pub use global_refinement::{GbaOutcome, GbaState, GlobalRefinement};
pub use lifecycle::Lifecycle;
pub use loop_closer::{
    spawn_loop_closer, spawn_subscriber, LoopCloser, LoopClosing, LoopClosingStats, PassOutcome,
};
pub use queue::KeyFrameQueue;
pub use sim3_solver::{compute_sim3_horn, Sim3Result, Sim3Solver, Sim3SolverConfig};
pub use verifier::{AcceptedLoop, GeometricVerifier, RemoteLoop, VerifierConfig};
