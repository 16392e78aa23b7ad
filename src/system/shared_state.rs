//! Shared state between the mapping front end and loop closing.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::atlas::{KeyFrameDatabase, Map};
use crate::vocabulary::OrbVocabulary;

/// Shared state accessible by mapping and loop closing.
pub struct SharedState {
    /// The map graph. Mapping and loop detection read, corrections write.
    pub map: RwLock<Map>,

    /// BoW inverted index over local keyframes.
    pub keyframe_db: RwLock<KeyFrameDatabase>,

    vocabulary: Arc<OrbVocabulary>,

    /// Outstanding requests for mapping to stop inserting keyframes. Loop
    /// correction and the GBA commit may overlap.
    pause_requests: AtomicUsize,

    /// Mapping acknowledges that it is idle while a pause is requested.
    mapping_paused: AtomicBool,

    /// Whether a mapping thread is running that will answer pause requests.
    mapping_attached: AtomicBool,
}

impl SharedState {
    /// Create a new SharedState with an empty map.
    pub fn new(vocabulary: Arc<OrbVocabulary>) -> Arc<Self> {
        Arc::new(Self {
            map: RwLock::new(Map::new()),
            keyframe_db: RwLock::new(KeyFrameDatabase::new()),
            vocabulary,
            pause_requests: AtomicUsize::new(0),
            mapping_paused: AtomicBool::new(false),
            mapping_attached: AtomicBool::new(false),
        })
    }

    pub fn vocabulary(&self) -> &Arc<OrbVocabulary> {
        &self.vocabulary
    }

    /// Register a mapping thread that polls [`Self::is_pause_requested`].
    pub fn attach_mapping(&self) {
        self.mapping_attached.store(true, Ordering::SeqCst);
    }

    pub fn detach_mapping(&self) {
        self.mapping_attached.store(false, Ordering::SeqCst);
        self.mapping_paused.store(false, Ordering::SeqCst);
    }

    pub fn is_mapping_attached(&self) -> bool {
        self.mapping_attached.load(Ordering::SeqCst)
    }

    /// Polled by mapping between keyframe insertions.
    pub fn is_pause_requested(&self) -> bool {
        self.pause_requests.load(Ordering::SeqCst) > 0
    }

    /// Mapping reports whether it is currently idle.
    pub fn set_mapping_paused(&self, paused: bool) {
        self.mapping_paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_mapping_paused(&self) -> bool {
        self.mapping_paused.load(Ordering::SeqCst)
    }

    /// Ask mapping to pause and wait up to `timeout` for the acknowledgement.
    ///
    /// The request is withdrawn when the returned guard is dropped; mapping
    /// stays paused while any guard is alive. Without an attached mapping
    /// thread the pause is granted immediately.
    pub fn pause_mapping(&self, timeout: Duration) -> MappingPause<'_> {
        self.pause_requests.fetch_add(1, Ordering::SeqCst);

        let mut acknowledged = true;
        if self.is_mapping_attached() {
            let start = Instant::now();
            while !self.is_mapping_paused() {
                if start.elapsed() > timeout {
                    tracing::warn!("Timeout waiting for mapping to pause");
                    acknowledged = false;
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }

        MappingPause {
            shared: self,
            acknowledged,
        }
    }
}

/// Scoped pause of mapping; see [`SharedState::pause_mapping`].
pub struct MappingPause<'a> {
    shared: &'a SharedState,
    acknowledged: bool,
}

impl MappingPause<'_> {
    /// False if mapping did not confirm within the timeout.
    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }
}

impl Drop for MappingPause<'_> {
    fn drop(&mut self) {
        self.shared.pause_requests.fetch_sub(1, Ordering::SeqCst);
    }
}
