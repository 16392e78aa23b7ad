//! Latest inter-robot loop closure, for an outside consumer to poll.
//!
//! The "retrieved" flag follows the engine's point of view: it turns true when
//! the engine has retrieved a loop closure and stays true until the consumer
//! clears it after reading.

use parking_lot::Mutex;

use crate::geometry::Sim3;

/// A loop found between one of our keyframes and a remote one.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopClosureResult {
    pub robot_id: u32,
    pub robot_symbol: char,
    pub remote_kf_id: u64,
    pub local_kf_id: u64,
    /// Maps the local keyframe's camera frame into the remote one's.
    pub relative: Sim3,
}

#[derive(Debug, Default)]
struct Slot {
    result: Option<LoopClosureResult>,
    retrieved: bool,
    posted: u64,
}

/// Single-slot mailbox. A newer result overwrites one not yet consumed.
#[derive(Debug, Default)]
pub struct LoopClosureMailbox {
    slot: Mutex<Slot>,
}

impl LoopClosureMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, result: LoopClosureResult) {
        let mut slot = self.slot.lock();
        if slot.retrieved {
            tracing::debug!("Overwriting unconsumed loop closure result");
        }
        slot.result = Some(result);
        slot.retrieved = true;
        slot.posted += 1;
    }

    /// True while a result is waiting to be consumed.
    pub fn is_retrieved(&self) -> bool {
        self.slot.lock().retrieved
    }

    pub fn set_retrieved(&self, retrieved: bool) {
        self.slot.lock().retrieved = retrieved;
    }

    pub fn latest(&self) -> Option<LoopClosureResult> {
        self.slot.lock().result.clone()
    }

    /// Consume the waiting result, if any, clearing the flag.
    pub fn take_new(&self) -> Option<LoopClosureResult> {
        let mut slot = self.slot.lock();
        if !slot.retrieved {
            return None;
        }
        slot.retrieved = false;
        slot.result.clone()
    }

    /// Results posted since creation or the last clear.
    pub fn posted(&self) -> u64 {
        self.slot.lock().posted
    }

    pub fn clear(&self) {
        *self.slot.lock() = Slot::default();
    }
}
