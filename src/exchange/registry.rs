//! Bookkeeping of the robots heard on the transport.

use std::collections::HashMap;

use thiserror::Error;

/// Why an incoming keyframe was not processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Published by this robot.
    #[error("own message")]
    OwnMessage,
    /// Same keyframe id as one already processed for that robot.
    #[error("duplicate keyframe {kf_id} from robot {robot_id}")]
    Duplicate { robot_id: u32, kf_id: u64 },
    /// Lower id than the newest keyframe seen from that robot.
    #[error("keyframe {kf_id} from robot {robot_id} is older than {latest}")]
    OutOfOrder { robot_id: u32, kf_id: u64, latest: u64 },
    /// The robot changed its symbol, which would alias packed keys.
    #[error("robot {robot_id} uses symbol '{got}' instead of '{expected}'")]
    SymbolMismatch { robot_id: u32, expected: char, got: char },
    #[error("malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotRecord {
    pub symbol: char,
    pub highest_kf_id: u64,
    pub keyframes_seen: u64,
}

/// Robots are registered lazily on their first keyframe.
#[derive(Debug)]
pub struct RobotRegistry {
    own_robot_id: u32,
    robots: HashMap<u32, RobotRecord>,
}

impl RobotRegistry {
    pub fn new(own_robot_id: u32) -> Self {
        Self {
            own_robot_id,
            robots: HashMap::new(),
        }
    }

    /// Admit keyframe `kf_id` from `robot_id` or say why not. Admission
    /// records it, so the same id is rejected afterwards.
    pub fn admit(&mut self, robot_id: u32, symbol: char, kf_id: u64) -> Result<(), DropReason> {
        if robot_id == self.own_robot_id {
            return Err(DropReason::OwnMessage);
        }
        match self.robots.get_mut(&robot_id) {
            None => {
                tracing::info!(robot_id, symbol = %symbol, "Registered robot");
                self.robots.insert(
                    robot_id,
                    RobotRecord {
                        symbol,
                        highest_kf_id: kf_id,
                        keyframes_seen: 1,
                    },
                );
                Ok(())
            }
            Some(record) => {
                if record.symbol != symbol {
                    return Err(DropReason::SymbolMismatch {
                        robot_id,
                        expected: record.symbol,
                        got: symbol,
                    });
                }
                if kf_id == record.highest_kf_id {
                    return Err(DropReason::Duplicate { robot_id, kf_id });
                }
                if kf_id < record.highest_kf_id {
                    return Err(DropReason::OutOfOrder {
                        robot_id,
                        kf_id,
                        latest: record.highest_kf_id,
                    });
                }
                record.highest_kf_id = kf_id;
                record.keyframes_seen += 1;
                Ok(())
            }
        }
    }

    pub fn get(&self, robot_id: u32) -> Option<&RobotRecord> {
        self.robots.get(&robot_id)
    }

    pub fn robot_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.robots.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.robots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.robots.is_empty()
    }

    pub fn clear(&mut self) {
        self.robots.clear();
    }
}
