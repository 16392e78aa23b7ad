//! Keyframe exchange between robots.
//!
//! - [`messages`] - robot-agnostic wire records
//! - [`codec`] - byte encodings
//! - [`registry`] - robots heard so far, duplicate and ordering checks
//! - [`mailbox`] - latest inter-robot loop closure for the front end
//! - [`transport`] - outgoing byte channel
//! - [`inter_robot`] - publish / subscribe and the remote detection path

pub mod codec;
pub mod inter_robot;
pub mod mailbox;
pub mod messages;
pub mod registry;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use codec::WireFormat;
pub use inter_robot::{ExchangeStats, IngestOutcome, InterRobotExchange};
pub use mailbox::{LoopClosureMailbox, LoopClosureResult};
pub use messages::{
    symbol_key, symbol_parts, KeyFrameBundle, MeasurementKind, MeasurementMsg, WireMessage,
};
pub use registry::{DropReason, RobotRecord, RobotRegistry};
pub use transport::{LoopbackBus, LoopbackEndpoint, NullTransport, Transport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub robot_id: u32,
    /// Prefix of this robot's packed keys. Must be unique in the team.
    pub robot_symbol: char,
    pub wire_format: WireFormat,
    /// Consecutive consistent passes required for a remote candidate.
    pub remote_consistency_threshold: usize,
    /// Minimum BoW score for remote queries. Remote keyframes have no
    /// covisibles here to derive one from.
    pub remote_min_score: f64,
    /// Keyframes of a robot ignored after a loop with it.
    pub min_remote_keyframes_between_loops: usize,
    /// Emit odometry measurements between consecutive published keyframes.
    pub publish_odometry: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            robot_id: 0,
            robot_symbol: 'a',
            wire_format: WireFormat::default(),
            remote_consistency_threshold: 3,
            remote_min_score: 0.01,
            min_remote_keyframes_between_loops: 10,
            publish_odometry: true,
        }
    }
}
