//! Reset and finish handshakes between callers and the processing thread.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Flags {
    reset_requested: bool,
    finish_requested: bool,
    finished: bool,
}

/// Request/acknowledge flags guarded by one mutex, with a condition
/// variable so requesters can wait for the acknowledgement.
#[derive(Debug, Default)]
pub struct Lifecycle {
    flags: Mutex<Flags>,
    changed: Condvar,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_reset(&self) {
        self.flags.lock().reset_requested = true;
    }

    /// Request a reset and wait until the processing thread performs it.
    /// Returns false on timeout; the request stays pending.
    pub fn request_reset_and_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock();
        flags.reset_requested = true;
        while flags.reset_requested {
            if self.changed.wait_until(&mut flags, deadline).timed_out() {
                return !flags.reset_requested;
            }
        }
        true
    }

    pub fn check_reset(&self) -> bool {
        self.flags.lock().reset_requested
    }

    /// Called by the processing thread once its state is cleared.
    pub fn acknowledge_reset(&self) {
        self.flags.lock().reset_requested = false;
        self.changed.notify_all();
    }

    pub fn request_finish(&self) {
        self.flags.lock().finish_requested = true;
    }

    pub fn check_finish(&self) -> bool {
        self.flags.lock().finish_requested
    }

    pub fn set_finish(&self) {
        self.flags.lock().finished = true;
        self.changed.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.flags.lock().finished
    }

    /// Wait until the processing thread reports it has finished.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flags = self.flags.lock();
        while !flags.finished {
            if self.changed.wait_until(&mut flags, deadline).timed_out() {
                return flags.finished;
            }
        }
        true
    }
}
