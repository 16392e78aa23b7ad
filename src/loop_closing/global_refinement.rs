//! Background Global Bundle Adjustment after a loop correction.
//!
//! One worker thread runs at a time. Every launch and every stop bumps a
//! generation counter; a worker only commits if its generation is still the
//! current one, so a refinement started before a newer loop never overwrites
//! that loop's correction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::atlas::map::KeyFrameId;
use crate::optimizer::{apply_global_ba_results, collect_global_ba_data, solve_global_ba, GlobalBAConfig};
use crate::system::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GbaState {
    Idle,
    Running,
    Finished,
    Aborted,
}

/// What the last worker did.
#[derive(Debug, Clone, PartialEq)]
pub struct GbaOutcome {
    pub generation: u64,
    pub trigger_kf: KeyFrameId,
    pub state: GbaState,
    /// Keyframes and landmarks written back to the map.
    pub updated: usize,
    pub final_error: Option<f64>,
}

struct Inner {
    state: Mutex<GbaState>,
    outcome: Mutex<Option<GbaOutcome>>,
    generation: AtomicU64,
    stop: AtomicBool,
    finished_runs: AtomicU64,
    aborted_runs: AtomicU64,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        !self.stop.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    // Launches join the previous worker first, so the reporting worker always
    // owns the state.
    fn finish(&self, outcome: GbaOutcome) {
        let counter = match outcome.state {
            GbaState::Finished => &self.finished_runs,
            _ => &self.aborted_runs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        *self.state.lock() = outcome.state;
        *self.outcome.lock() = Some(outcome);
    }
}

/// Marks the run as aborted if the worker unwinds before reporting.
struct AbortOnUnwind<'a> {
    inner: &'a Inner,
    generation: u64,
    trigger_kf: KeyFrameId,
    reported: bool,
}

impl Drop for AbortOnUnwind<'_> {
    fn drop(&mut self) {
        if !self.reported {
            tracing::warn!(generation = self.generation, "Global BA worker unwound");
            self.inner.finish(GbaOutcome {
                generation: self.generation,
                trigger_kf: self.trigger_kf,
                state: GbaState::Aborted,
                updated: 0,
                final_error: None,
            });
        }
    }
}

pub struct GlobalRefinement {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
    config: GlobalBAConfig,
    pause_timeout: Duration,
}

impl GlobalRefinement {
    pub fn new(config: GlobalBAConfig, pause_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(GbaState::Idle),
                outcome: Mutex::new(None),
                generation: AtomicU64::new(0),
                stop: AtomicBool::new(false),
                finished_runs: AtomicU64::new(0),
                aborted_runs: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
            config,
            pause_timeout,
        }
    }

    pub fn state(&self) -> GbaState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == GbaState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state() == GbaState::Finished
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn last_outcome(&self) -> Option<GbaOutcome> {
        self.inner.outcome.lock().clone()
    }

    /// Runs that committed and runs that were abandoned, since creation.
    pub fn run_counts(&self) -> (u64, u64) {
        (
            self.inner.finished_runs.load(Ordering::Relaxed),
            self.inner.aborted_runs.load(Ordering::Relaxed),
        )
    }

    /// Request cancellation of the running worker. Returns immediately; the
    /// worker notices at its next iteration.
    pub fn stop(&self) {
        if self.is_running() {
            tracing::info!("Stopping Global BA");
            self.inner.stop.store(true, Ordering::SeqCst);
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Wait for the current worker, if any, to exit.
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Global BA thread panicked");
            }
        }
    }

    /// Back to `Idle` once no worker is running.
    pub fn reset(&self) {
        self.stop();
        self.join();
        *self.inner.state.lock() = GbaState::Idle;
    }

    /// Stop any running worker and start a new one for `trigger_kf`.
    pub fn launch(&self, shared: Arc<SharedState>, trigger_kf: KeyFrameId) {
        self.stop();
        self.join();

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.stop.store(false, Ordering::SeqCst);
        *self.inner.state.lock() = GbaState::Running;

        tracing::info!(generation, trigger = %trigger_kf, "Starting Global BA");

        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        let pause_timeout = self.pause_timeout;
        let handle = thread::spawn(move || {
            let mut guard = AbortOnUnwind {
                inner: &inner,
                generation,
                trigger_kf,
                reported: false,
            };
            let outcome = run_global_ba(&inner, &shared, &config, pause_timeout, generation, trigger_kf);
            match outcome.state {
                GbaState::Finished => tracing::info!(
                    generation,
                    updated = outcome.updated,
                    "Global BA finished"
                ),
                _ => tracing::info!(generation, "Global BA aborted"),
            }
            guard.reported = true;
            inner.finish(outcome);
        });
        *self.handle.lock() = Some(handle);
    }
}

impl Drop for GlobalRefinement {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn run_global_ba(
    inner: &Inner,
    shared: &SharedState,
    config: &GlobalBAConfig,
    pause_timeout: Duration,
    generation: u64,
    trigger_kf: KeyFrameId,
) -> GbaOutcome {
    let aborted = GbaOutcome {
        generation,
        trigger_kf,
        state: GbaState::Aborted,
        updated: 0,
        final_error: None,
    };

    let problem = {
        let map = shared.map.read();
        collect_global_ba_data(&map)
    };
    if !inner.is_current(generation) {
        return aborted;
    }
    let Some(problem) = problem else {
        return aborted;
    };

    let should_stop = || !inner.is_current(generation);
    let Some(result) = solve_global_ba(&problem, config, &should_stop) else {
        return aborted;
    };

    let _pause = shared.pause_mapping(pause_timeout);
    let mut map = shared.map.write();
    if !inner.is_current(generation) {
        return aborted;
    }
    let updated = apply_global_ba_results(&mut map, &result);

    GbaOutcome {
        generation,
        trigger_kf,
        state: GbaState::Finished,
        updated,
        final_error: Some(result.final_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::OrbVocabulary;

    fn shared() -> Arc<SharedState> {
        let vocabulary = OrbVocabulary::from_words(&[[0u8; 32]]).unwrap();
        SharedState::new(Arc::new(vocabulary))
    }

    #[test]
    fn test_starts_idle() {
        let gba = GlobalRefinement::new(GlobalBAConfig::default(), Duration::from_millis(10));
        assert_eq!(gba.state(), GbaState::Idle);
        assert!(!gba.is_running());
        assert!(gba.last_outcome().is_none());
    }

    #[test]
    fn test_empty_map_aborts() {
        let gba = GlobalRefinement::new(GlobalBAConfig::default(), Duration::from_millis(10));
        gba.launch(shared(), KeyFrameId::new(0));
        gba.join();
        assert_eq!(gba.state(), GbaState::Aborted);
        assert_eq!(gba.generation(), 1);
        assert_eq!(gba.run_counts(), (0, 1));
    }

    #[test]
    fn test_stop_before_collect_aborts() {
        let shared = shared();
        let gba = GlobalRefinement::new(GlobalBAConfig::default(), Duration::from_millis(10));
        {
            // The worker blocks on the map until we are done.
            let _map = shared.map.write();
            gba.launch(Arc::clone(&shared), KeyFrameId::new(0));
            assert!(gba.is_running());
            gba.stop();
        }
        gba.join();
        assert_eq!(gba.state(), GbaState::Aborted);
        assert_eq!(gba.generation(), 2);
        let outcome = gba.last_outcome().unwrap();
        assert_eq!(outcome.generation, 1);
        assert_eq!(outcome.state, GbaState::Aborted);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let gba = GlobalRefinement::new(GlobalBAConfig::default(), Duration::from_millis(10));
        gba.launch(shared(), KeyFrameId::new(0));
        gba.reset();
        assert_eq!(gba.state(), GbaState::Idle);
    }
}
