//! Publish side of the inter-robot link, and an in-process bus for tests
//! and single-process simulations.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{LoopClosingError, Result};

/// Outgoing byte channel. Delivery of incoming bytes is the caller's job:
/// whatever receives them hands them to `InterRobotExchange::subscribe`.
pub trait Transport: Send + Sync {
    fn publish(&self, bytes: Vec<u8>) -> Result<()>;
}

/// Drops everything. For single-robot runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn publish(&self, _bytes: Vec<u8>) -> Result<()> {
        Ok(())
    }
}

/// Broadcast bus: a message published by one endpoint reaches every other.
#[derive(Default)]
pub struct LoopbackBus {
    subscribers: Mutex<Vec<(u32, Sender<Vec<u8>>)>>,
}

impl LoopbackBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(self: &Arc<Self>, robot_id: u32) -> (LoopbackEndpoint, Receiver<Vec<u8>>) {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push((robot_id, tx));
        (
            LoopbackEndpoint {
                bus: Arc::clone(self),
                robot_id,
            },
            rx,
        )
    }

    fn broadcast(&self, from: u32, bytes: Vec<u8>) -> Result<()> {
        let mut subscribers = self.subscribers.lock();
        // Receivers that went away are forgotten.
        subscribers.retain(|(id, tx)| *id == from || tx.send(bytes.clone()).is_ok());
        Ok(())
    }
}

#[derive(Clone)]
pub struct LoopbackEndpoint {
    bus: Arc<LoopbackBus>,
    robot_id: u32,
}

impl Transport for LoopbackEndpoint {
    fn publish(&self, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Err(LoopClosingError::Transport("empty payload".into()));
        }
        self.bus.broadcast(self.robot_id, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_skips_sender() {
        let bus = LoopbackBus::new();
        let (a, rx_a) = bus.connect(0);
        let (_b, rx_b) = bus.connect(1);
        let (_c, rx_c) = bus.connect(2);

        a.publish(vec![1, 2, 3]).unwrap();
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), vec![1, 2, 3]);
        assert_eq!(rx_c.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dropped_receiver_is_forgotten() {
        let bus = LoopbackBus::new();
        let (a, _rx_a) = bus.connect(0);
        let (_b, rx_b) = bus.connect(1);
        drop(rx_b);
        assert!(a.publish(vec![7]).is_ok());
        assert_eq!(bus.subscribers.lock().len(), 1);
    }
}
