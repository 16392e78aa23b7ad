//! Keyframe intake queue between mapping and loop closing.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::atlas::map::KeyFrameId;

/// Unbounded FIFO of keyframes waiting for loop detection.
///
/// Inserting never blocks; each keyframe is popped exactly once.
pub struct KeyFrameQueue {
    sender: Sender<KeyFrameId>,
    receiver: Receiver<KeyFrameId>,
}

impl KeyFrameQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn insert(&self, kf_id: KeyFrameId) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.sender.send(kf_id);
    }

    /// Whether work is pending. Does not consume anything.
    pub fn has_pending(&self) -> bool {
        !self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn pop(&self) -> Option<KeyFrameId> {
        self.receiver.try_recv().ok()
    }

    /// Wait up to `timeout` for the next keyframe.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<KeyFrameId> {
        match self.receiver.recv_timeout(timeout) {
            Ok(kf_id) => Some(kf_id),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drop everything queued. Returns how many keyframes were discarded.
    pub fn clear(&self) -> usize {
        self.receiver.try_iter().count()
    }
}

impl Default for KeyFrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_and_single_delivery() {
        let queue = KeyFrameQueue::new();
        assert!(!queue.has_pending());
        queue.insert(KeyFrameId::new(1));
        queue.insert(KeyFrameId::new(2));
        assert!(queue.has_pending());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(KeyFrameId::new(1)));
        assert_eq!(queue.pop(), Some(KeyFrameId::new(2)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_clear() {
        let queue = KeyFrameQueue::new();
        for i in 0..5 {
            queue.insert(KeyFrameId::new(i));
        }
        assert_eq!(queue.clear(), 5);
        assert!(queue.is_empty());
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), None);
    }
}
