//! LoopCloser - the loop closing engine and its processing thread.
//!
//! [`LoopClosing`] is the handle shared with mapping, the transport and the
//! front end. [`LoopCloser`] owns the per-pass state (consistency groups,
//! verifier, corrector) and runs on a dedicated thread:
//! 1. Pops one keyframe from the intake queue
//! 2. Detects consistent loop candidates using BoW
//! 3. Verifies them with Sim3 RANSAC, refinement and projection
//! 4. Corrects the map with mapping paused
//! 5. Launches Global BA in the background
//!
//! Every keyframe is added to the database and published to other robots
//! whether or not it closed a loop.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use crate::atlas::map::KeyFrameId;
use crate::config::LoopClosingConfig;
use crate::error::{LoopClosingError, Result};
use crate::exchange::{IngestOutcome, InterRobotExchange, LoopClosureResult};
use crate::system::SharedState;
use crate::vocabulary::BowVector;

use super::corrector::{CorrectionOutcome, LoopCorrector};
use super::detector::{compute_min_score, LoopDetector};
use super::global_refinement::{GbaState, GlobalRefinement};
use super::lifecycle::Lifecycle;
use super::queue::KeyFrameQueue;
use super::verifier::{AcceptedLoop, GeometricVerifier};

/// Timeout for receiving keyframes from the queue.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Counters over the engine's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopClosingStats {
    pub keyframes_processed: u64,
    pub candidates_detected: u64,
    pub loops_detected: u64,
    pub loops_corrected: u64,
    pub remote_accepted: u64,
    pub remote_dropped: u64,
    pub remote_loops: u64,
    pub gba_finished: u64,
    pub gba_aborted: u64,
}

#[derive(Default)]
struct Counters {
    keyframes_processed: AtomicU64,
    candidates_detected: AtomicU64,
    loops_detected: AtomicU64,
    loops_corrected: AtomicU64,
}

/// Result of one processing pass.
#[derive(Debug, Clone)]
pub enum PassOutcome {
    /// Too soon after the last loop, or too few keyframes in the map.
    Skipped,
    /// No candidate reached the consistency threshold.
    NoCandidates,
    /// Candidates were found but none survived verification.
    Rejected,
    Corrected(Box<CorrectionOutcome>),
}

/// Handle to the loop closing engine.
pub struct LoopClosing {
    shared: Arc<SharedState>,
    exchange: Arc<InterRobotExchange>,
    config: LoopClosingConfig,
    queue: KeyFrameQueue,
    lifecycle: Lifecycle,
    gba: GlobalRefinement,
    last_loop_kf_id: Mutex<Option<KeyFrameId>>,
    counters: Counters,
}

impl LoopClosing {
    pub fn new(
        shared: Arc<SharedState>,
        exchange: Arc<InterRobotExchange>,
        config: LoopClosingConfig,
    ) -> Arc<Self> {
        let gba = GlobalRefinement::new(
            config.global_ba.clone(),
            Duration::from_millis(config.mapping_pause_timeout_ms),
        );
        Arc::new(Self {
            shared,
            exchange,
            config,
            queue: KeyFrameQueue::new(),
            lifecycle: Lifecycle::new(),
            gba,
            last_loop_kf_id: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn exchange(&self) -> &Arc<InterRobotExchange> {
        &self.exchange
    }

    pub fn config(&self) -> &LoopClosingConfig {
        &self.config
    }

    /// Queue a keyframe for detection. Never blocks.
    pub fn insert_keyframe(&self, kf_id: KeyFrameId) -> Result<()> {
        if self.lifecycle.is_finished() {
            return Err(LoopClosingError::Finished);
        }
        self.queue.insert(kf_id);
        Ok(())
    }

    pub fn check_new_keyframes(&self) -> bool {
        self.queue.has_pending()
    }

    /// Hand an incoming transport message to the exchange.
    pub fn subscribe(&self, bytes: &[u8]) -> IngestOutcome {
        self.exchange.subscribe(bytes)
    }

    /// Ask the processing thread to clear its state. Returns immediately.
    pub fn request_reset(&self) {
        self.lifecycle.request_reset();
    }

    /// Ask for a reset and wait until the processing thread has done it.
    pub fn request_reset_and_wait(&self, timeout: Duration) -> bool {
        self.lifecycle.request_reset_and_wait(timeout)
    }

    pub fn request_finish(&self) {
        self.lifecycle.request_finish();
    }

    pub fn is_finished(&self) -> bool {
        self.lifecycle.is_finished()
    }

    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_finished(timeout)
    }

    pub fn is_running_gba(&self) -> bool {
        self.gba.is_running()
    }

    pub fn is_finished_gba(&self) -> bool {
        self.gba.is_finished()
    }

    pub fn gba_state(&self) -> GbaState {
        self.gba.state()
    }

    pub fn stop_gba(&self) {
        self.gba.stop();
    }

    /// Wait for the background refinement, if any, to exit.
    pub fn join_gba(&self) {
        self.gba.join();
    }

    pub fn last_loop_kf_id(&self) -> Option<KeyFrameId> {
        *self.last_loop_kf_id.lock()
    }

    pub fn stats(&self) -> LoopClosingStats {
        let exchange = self.exchange.stats();
        let (gba_finished, gba_aborted) = self.gba.run_counts();
        LoopClosingStats {
            keyframes_processed: self.counters.keyframes_processed.load(Ordering::Relaxed),
            candidates_detected: self.counters.candidates_detected.load(Ordering::Relaxed),
            loops_detected: self.counters.loops_detected.load(Ordering::Relaxed),
            loops_corrected: self.counters.loops_corrected.load(Ordering::Relaxed),
            remote_accepted: exchange.accepted,
            remote_dropped: exchange.dropped,
            remote_loops: exchange.remote_loops,
            gba_finished,
            gba_aborted,
        }
    }

    pub fn loop_closure_is_retrieved(&self) -> bool {
        self.exchange.mailbox().is_retrieved()
    }

    pub fn set_loop_closure_retrieved_to_true(&self) {
        self.exchange.mailbox().set_retrieved(true);
    }

    pub fn set_loop_closure_retrieved_to_false(&self) {
        self.exchange.mailbox().set_retrieved(false);
    }

    pub fn latest_loop_closure(&self) -> Option<LoopClosureResult> {
        self.exchange.mailbox().latest()
    }
}

/// The processing side of the engine.
pub struct LoopCloser {
    engine: Arc<LoopClosing>,
    detector: LoopDetector,
    verifier: GeometricVerifier,
    corrector: LoopCorrector,
}

impl LoopCloser {
    pub fn new(engine: Arc<LoopClosing>) -> Self {
        let config = engine.config();
        let detector = LoopDetector::new(&config.detector);
        let verifier = GeometricVerifier::new(
            config.matcher.clone(),
            config.sim3_solver.clone(),
            config.verifier.clone(),
            config.fix_scale,
        );
        let corrector = LoopCorrector::new(
            config.corrector.clone(),
            config.essential_graph.clone(),
            config.fix_scale,
        );
        Self {
            engine,
            detector,
            verifier,
            corrector,
        }
    }

    pub fn detector(&self) -> &LoopDetector {
        &self.detector
    }

    /// Run until finish is requested.
    pub fn run(&mut self) {
        tracing::info!("LoopCloser thread started");

        loop {
            self.reset_if_requested();
            if self.engine.lifecycle.check_finish() {
                break;
            }

            let Some(kf_id) = self.engine.queue.pop_timeout(RECV_TIMEOUT) else {
                continue;
            };
            if let Err(e) = self.process_keyframe(kf_id) {
                tracing::warn!(kf = %kf_id, error = %e, "Loop closing pass failed");
            }
        }

        self.engine.gba.stop();
        self.engine.gba.join();
        self.engine.lifecycle.set_finish();

        let stats = self.engine.stats();
        tracing::info!(
            processed = stats.keyframes_processed,
            detected = stats.loops_detected,
            corrected = stats.loops_corrected,
            remote_loops = stats.remote_loops,
            "LoopCloser thread exiting"
        );
    }

    /// One synchronous pass over the next queued keyframe, if any.
    pub fn process_next(&mut self) -> Option<Result<PassOutcome>> {
        self.reset_if_requested();
        let kf_id = self.engine.queue.pop()?;
        Some(self.process_keyframe(kf_id))
    }

    fn reset_if_requested(&mut self) {
        if !self.engine.lifecycle.check_reset() {
            return;
        }
        let dropped = self.engine.queue.clear();
        self.detector.clear();
        self.engine.exchange.reset();
        self.engine.gba.reset();
        *self.engine.last_loop_kf_id.lock() = None;
        tracing::info!(dropped, "Loop closing reset");
        self.engine.lifecycle.acknowledge_reset();
    }

    /// Detection, verification and correction for one keyframe.
    pub fn process_keyframe(&mut self, kf_id: KeyFrameId) -> Result<PassOutcome> {
        let engine = Arc::clone(&self.engine);
        let shared = &engine.shared;
        engine.counters.keyframes_processed.fetch_add(1, Ordering::Relaxed);

        let bow = self.ensure_bow(kf_id)?;

        let outcome = self.detect_and_verify(kf_id, &bow);

        shared.keyframe_db.write().add(kf_id, bow);
        if let Err(e) = engine.exchange.publish_keyframe(kf_id) {
            tracing::warn!(kf = %kf_id, error = %e, "Failed to publish keyframe");
        }

        let accepted = match outcome {
            Detection::Skipped => return Ok(PassOutcome::Skipped),
            Detection::NoCandidates => return Ok(PassOutcome::NoCandidates),
            Detection::Rejected => return Ok(PassOutcome::Rejected),
            Detection::Accepted(accepted) => accepted,
        };

        // A refinement computed before this loop must not commit over it.
        engine.gba.stop();

        let correction = {
            let pause = shared.pause_mapping(Duration::from_millis(engine.config.mapping_pause_timeout_ms));
            if !pause.acknowledged() {
                tracing::warn!("Mapping did not acknowledge the pause, correcting anyway");
            }
            let mut map = shared.map.write();
            self.corrector.correct(&mut map, *accepted)?
        };

        *engine.last_loop_kf_id.lock() = Some(kf_id);
        engine.counters.loops_corrected.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            current = %correction.current_kf,
            loop_kf = %correction.loop_kf,
            neighbourhood = correction.corrected_poses.len(),
            fused = correction.fused_points,
            "Loop closed"
        );

        if self.corrector.config().run_global_ba {
            engine.gba.launch(Arc::clone(shared), kf_id);
        }

        Ok(PassOutcome::Corrected(Box::new(correction)))
    }

    /// BoW vector of `kf_id`, computing it on first use. A keyframe without
    /// features has nothing to query or index with.
    fn ensure_bow(&self, kf_id: KeyFrameId) -> Result<BowVector> {
        let shared = &self.engine.shared;
        let mut map = shared.map.write();
        let kf = map
            .get_keyframe_mut(kf_id)
            .ok_or(LoopClosingError::UnknownKeyFrame(kf_id))?;
        if let Some(bow) = kf.bow_vector() {
            if bow.is_empty() {
                return Err(LoopClosingError::MissingBow(kf_id));
            }
            return Ok(bow.clone());
        }
        let (bow, features) = shared
            .vocabulary()
            .transform(&kf.descriptors, self.engine.config.bow_levels_up);
        if bow.is_empty() {
            return Err(LoopClosingError::MissingBow(kf_id));
        }
        kf.set_bow(bow.clone(), features);
        Ok(bow)
    }

    fn detect_and_verify(&mut self, kf_id: KeyFrameId, bow: &BowVector) -> Detection {
        let engine = &self.engine;
        let map = engine.shared.map.read();
        let min_gap = engine.config.detector.min_keyframes_since_loop;

        let last_loop = engine.last_loop_kf_id().map_or(0, |id| id.0);
        if kf_id.0 < last_loop + min_gap || (map.num_keyframes() as u64) < min_gap {
            return Detection::Skipped;
        }

        let min_score = compute_min_score(&map, kf_id, bow);
        let mut excluded: HashSet<KeyFrameId> = map.connected_keyframes(kf_id);
        excluded.insert(kf_id);

        let detected = {
            let database = engine.shared.keyframe_db.read();
            self.detector.detect_loop(&map, &database, bow, &excluded, min_score)
        };
        if !detected {
            return Detection::NoCandidates;
        }

        let candidates = self.detector.take_candidates();
        engine.counters.candidates_detected.fetch_add(candidates.len() as u64, Ordering::Relaxed);
        tracing::debug!(kf = %kf_id, candidates = candidates.len(), "Loop candidates detected");

        match self.verifier.verify_local(&map, kf_id, &candidates) {
            Some(accepted) => {
                engine.counters.loops_detected.fetch_add(1, Ordering::Relaxed);
                Detection::Accepted(Box::new(accepted))
            }
            None => {
                tracing::debug!(kf = %kf_id, "Loop candidates failed verification");
                Detection::Rejected
            }
        }
    }
}

enum Detection {
    Skipped,
    NoCandidates,
    Rejected,
    Accepted(Box<AcceptedLoop>),
}

/// Spawn the loop closer thread.
pub fn spawn_loop_closer(engine: Arc<LoopClosing>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut loop_closer = LoopCloser::new(engine);
        loop_closer.run();
    })
}

/// Spawn a thread feeding transport deliveries into the engine until finish
/// is requested or the channel disconnects.
pub fn spawn_subscriber(engine: Arc<LoopClosing>, inbox: Receiver<Vec<u8>>) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        if engine.lifecycle.check_finish() {
            break;
        }
        match inbox.recv_timeout(RECV_TIMEOUT) {
            Ok(bytes) => {
                engine.subscribe(&bytes);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("Inter-robot inbox disconnected");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::NullTransport;
    use crate::geometry::{CameraModel, ScalePyramid, SE3};
    use crate::vocabulary::OrbVocabulary;

    fn engine() -> Arc<LoopClosing> {
        let vocabulary = OrbVocabulary::from_words(&[[0u8; 32], [255u8; 32]]).unwrap();
        let shared = SharedState::new(Arc::new(vocabulary));
        let config = LoopClosingConfig::default();
        let exchange = Arc::new(InterRobotExchange::new(&config, Arc::clone(&shared), Arc::new(NullTransport)));
        LoopClosing::new(shared, exchange, config)
    }

    #[test]
    fn test_unknown_keyframe_pass_fails() {
        let engine = engine();
        let mut closer = LoopCloser::new(Arc::clone(&engine));
        engine.insert_keyframe(KeyFrameId::new(4)).unwrap();
        assert!(engine.check_new_keyframes());
        let result = closer.process_next().unwrap();
        assert!(matches!(result, Err(LoopClosingError::UnknownKeyFrame(_))));
        assert!(closer.process_next().is_none());
        assert_eq!(engine.stats().keyframes_processed, 1);
    }

    #[test]
    fn test_featureless_keyframe_has_no_bow() {
        let engine = engine();
        let kf_id = engine.shared().map.write().create_keyframe(
            0,
            SE3::identity(),
            CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0),
            Arc::new(ScalePyramid::default()),
            Vec::new(),
            Vec::new(),
        );
        let mut closer = LoopCloser::new(Arc::clone(&engine));
        engine.insert_keyframe(kf_id).unwrap();
        let result = closer.process_next().unwrap();
        assert!(matches!(result, Err(LoopClosingError::MissingBow(id)) if id == kf_id));
        assert!(engine.shared().keyframe_db.read().is_empty());
    }

    #[test]
    fn test_reset_clears_queue() {
        let engine = engine();
        let mut closer = LoopCloser::new(Arc::clone(&engine));
        for i in 0..3 {
            engine.insert_keyframe(KeyFrameId::new(i)).unwrap();
        }
        engine.request_reset();
        assert!(closer.process_next().is_none());
        assert!(!engine.check_new_keyframes());
        assert!(engine.last_loop_kf_id().is_none());
    }

    #[test]
    fn test_finish_stops_thread() {
        let engine = engine();
        let handle = spawn_loop_closer(Arc::clone(&engine));
        engine.request_finish();
        assert!(engine.wait_finished(Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(engine.is_finished());
        assert!(matches!(
            engine.insert_keyframe(KeyFrameId::new(0)),
            Err(LoopClosingError::Finished)
        ));
        assert_eq!(engine.gba_state(), GbaState::Idle);
    }
}
