//! Publish local keyframes and run remote keyframes through loop detection.
//!
//! A remote keyframe never enters the local map. It is rebuilt as a
//! [`KeyFrameSnapshot`] in its sender's key namespace, queried against the
//! local keyframe database, voted on by a per-robot consistency tracker and
//! verified against the local candidates. A confirmed loop is posted to the
//! [`LoopClosureMailbox`] and published as a measurement for the back end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::mailbox::{LoopClosureMailbox, LoopClosureResult};
use super::messages::{symbol_key, KeyFrameBundle, MeasurementKind, MeasurementMsg, WireMessage};
use super::registry::{DropReason, RobotRegistry};
use super::transport::Transport;
use super::ExchangeConfig;
use crate::atlas::map::{KeyFrameId, KeyFrameSnapshot};
use crate::config::LoopClosingConfig;
use crate::error::{LoopClosingError, Result};
use crate::geometry::{Sim3, SE3};
use crate::loop_closing::{GeometricVerifier, LoopDetector, RemoteLoop};
use crate::system::SharedState;

/// What happened to one incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// A remote keyframe was processed. `loop_closure` is set when it closed
    /// a loop with the local map.
    Accepted {
        robot_id: u32,
        kf_id: u64,
        loop_closure: Option<LoopClosureResult>,
    },
    /// A measurement from another robot. The engine does not consume these;
    /// they are returned for a back end that does.
    Measurement(MeasurementMsg),
    Dropped(DropReason),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeStats {
    pub published: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub remote_loops: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    remote_loops: AtomicU64,
}

/// Detection state for one remote robot.
struct RemoteRobot {
    detector: LoopDetector,
    /// Keyframes still to skip after the last loop with this robot.
    cooldown: usize,
}

pub struct InterRobotExchange {
    config: ExchangeConfig,
    bow_levels_up: usize,
    shared: Arc<SharedState>,
    transport: Arc<dyn Transport>,
    verifier: GeometricVerifier,
    registry: Mutex<RobotRegistry>,
    robots: Mutex<HashMap<u32, RemoteRobot>>,
    mailbox: LoopClosureMailbox,
    last_published: Mutex<Option<(u64, SE3)>>,
    counters: Counters,
}

impl InterRobotExchange {
    pub fn new(
        config: &LoopClosingConfig,
        shared: Arc<SharedState>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let verifier = GeometricVerifier::new(
            config.matcher.clone(),
            config.sim3_solver.clone(),
            config.verifier.clone(),
            config.fix_scale,
        );
        Self {
            config: config.exchange.clone(),
            bow_levels_up: config.bow_levels_up,
            shared,
            transport,
            verifier,
            registry: Mutex::new(RobotRegistry::new(config.exchange.robot_id)),
            robots: Mutex::new(HashMap::new()),
            mailbox: LoopClosureMailbox::new(),
            last_published: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    pub fn robot_id(&self) -> u32 {
        self.config.robot_id
    }

    pub fn robot_symbol(&self) -> char {
        self.config.robot_symbol
    }

    pub fn mailbox(&self) -> &LoopClosureMailbox {
        &self.mailbox
    }

    pub fn stats(&self) -> ExchangeStats {
        ExchangeStats {
            published: self.counters.published.load(Ordering::Relaxed),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            remote_loops: self.counters.remote_loops.load(Ordering::Relaxed),
        }
    }

    /// Robots registered so far.
    pub fn known_robots(&self) -> Vec<u32> {
        self.registry.lock().robot_ids()
    }

    /// Forget every remote robot and the pending result.
    pub fn reset(&self) {
        self.registry.lock().clear();
        self.robots.lock().clear();
        self.mailbox.clear();
        *self.last_published.lock() = None;
    }

    /// Publish a local keyframe, followed by an odometry measurement from the
    /// previously published one when enabled.
    pub fn publish_keyframe(&self, kf_id: KeyFrameId) -> Result<()> {
        let snapshot = {
            let map = self.shared.map.read();
            map.snapshot_keyframe(kf_id)
                .ok_or(LoopClosingError::UnknownKeyFrame(kf_id))?
        };
        let bundle =
            KeyFrameBundle::from_snapshot(self.config.robot_id, self.config.robot_symbol, &snapshot);
        self.send(&WireMessage::KeyFrame(bundle))?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        let previous = self.last_published.lock().replace((kf_id.0, snapshot.pose));
        if !self.config.publish_odometry {
            return Ok(());
        }
        if let Some((prev_id, prev_pose)) = previous.filter(|(prev_id, _)| *prev_id != kf_id.0) {
            let relative = Sim3::from_se3(&prev_pose.inverse().compose(&snapshot.pose));
            self.send(&WireMessage::Measurement(MeasurementMsg::new(
                self.config.robot_id,
                MeasurementKind::Odometry,
                symbol_key(self.config.robot_symbol, prev_id),
                symbol_key(self.config.robot_symbol, kf_id.0),
                &relative,
            )))?;
        }
        Ok(())
    }

    fn send(&self, message: &WireMessage) -> Result<()> {
        let bytes = self.config.wire_format.encode(message)?;
        self.transport.publish(bytes)
    }

    /// Handle one incoming message. Never fails: anything unusable is
    /// reported as [`IngestOutcome::Dropped`].
    pub fn subscribe(&self, bytes: &[u8]) -> IngestOutcome {
        let message = match self.config.wire_format.decode(bytes) {
            Ok(message) => message,
            Err(e) => return self.drop_message(DropReason::Malformed(e.to_string())),
        };
        match message {
            WireMessage::Measurement(measurement) => {
                if measurement.robot_id == self.config.robot_id {
                    return self.drop_message(DropReason::OwnMessage);
                }
                IngestOutcome::Measurement(measurement)
            }
            WireMessage::KeyFrame(bundle) => self.ingest_keyframe(bundle),
        }
    }

    fn drop_message(&self, reason: DropReason) -> IngestOutcome {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        match &reason {
            DropReason::OwnMessage => tracing::trace!("Ignoring own message"),
            _ => tracing::debug!(%reason, "Dropped inter-robot message"),
        }
        IngestOutcome::Dropped(reason)
    }

    fn ingest_keyframe(&self, bundle: KeyFrameBundle) -> IngestOutcome {
        let robot_id = bundle.keyframe.robot_id;
        let symbol = bundle.keyframe.robot_symbol;
        let kf_id = bundle.keyframe.kf_id;

        if robot_id == self.config.robot_id {
            return self.drop_message(DropReason::OwnMessage);
        }
        if let Err(e) = bundle.validate() {
            return self.drop_message(DropReason::Malformed(e.to_string()));
        }
        if let Err(reason) = self.registry.lock().admit(robot_id, symbol, kf_id) {
            return self.drop_message(reason);
        }
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);

        let (bow, features) = self
            .shared
            .vocabulary()
            .transform(&bundle.descriptors(), self.bow_levels_up);
        let remote = bundle.to_snapshot(bow, features);

        let loop_closure = self
            .detect_and_verify(robot_id, &remote)
            .map(|found| self.confirm(robot_id, symbol, kf_id, found));

        IngestOutcome::Accepted {
            robot_id,
            kf_id,
            loop_closure,
        }
    }

    fn detect_and_verify(&self, robot_id: u32, remote: &KeyFrameSnapshot) -> Option<RemoteLoop> {
        let mut robots = self.robots.lock();
        let robot = robots.entry(robot_id).or_insert_with(|| RemoteRobot {
            detector: LoopDetector::with_threshold(self.config.remote_consistency_threshold),
            cooldown: 0,
        });
        if robot.cooldown > 0 {
            robot.cooldown -= 1;
            tracing::trace!(robot_id, remaining = robot.cooldown, "Remote keyframe in cooldown");
            return None;
        }

        let map = self.shared.map.read();
        let database = self.shared.keyframe_db.read();
        // No local keyframe is covisible with a remote one.
        let excluded = HashSet::new();
        if !robot.detector.detect_loop(
            &map,
            &database,
            &remote.bow_vector,
            &excluded,
            self.config.remote_min_score,
        ) {
            return None;
        }
        let candidates = robot.detector.take_candidates();
        let found = self.verifier.verify_remote(&map, remote, &candidates)?;

        robot.detector.clear();
        robot.cooldown = self.config.min_remote_keyframes_between_loops;
        Some(found)
    }

    fn confirm(&self, robot_id: u32, symbol: char, remote_kf_id: u64, found: RemoteLoop) -> LoopClosureResult {
        self.counters.remote_loops.fetch_add(1, Ordering::Relaxed);
        let result = LoopClosureResult {
            robot_id,
            robot_symbol: symbol,
            remote_kf_id,
            local_kf_id: found.local_kf.0,
            relative: found.s12,
        };
        tracing::info!(
            robot_id,
            remote_kf = remote_kf_id,
            local_kf = %found.local_kf,
            inliers = found.num_inliers,
            scale = found.s12.scale,
            "Inter-robot loop closure"
        );

        let measurement = MeasurementMsg::new(
            self.config.robot_id,
            MeasurementKind::LoopClosure,
            symbol_key(symbol, remote_kf_id),
            symbol_key(self.config.robot_symbol, found.local_kf.0),
            &found.s12,
        );
        if let Err(e) = self.send(&WireMessage::Measurement(measurement)) {
            tracing::warn!(error = %e, "Failed to publish loop measurement");
        }

        self.mailbox.post(result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::codec::WireFormat;
    use crate::exchange::transport::{LoopbackBus, NullTransport};
    use crate::atlas::map::KeyPoint;
    use crate::geometry::{CameraModel, ScalePyramid};
    use crate::vocabulary::OrbVocabulary;

    fn shared() -> Arc<SharedState> {
        let words: Vec<[u8; 32]> = (0..4u8).map(|i| [i * 60; 32]).collect();
        let vocabulary = OrbVocabulary::from_words(&words).unwrap();
        SharedState::new(Arc::new(vocabulary))
    }

    fn add_keyframe(shared: &SharedState) -> KeyFrameId {
        let mut map = shared.map.write();
        map.create_keyframe(
            0,
            SE3::identity(),
            CameraModel::new(500.0, 500.0, 320.0, 240.0, 640.0, 480.0),
            Arc::new(ScalePyramid::default()),
            vec![KeyPoint::new(100.0, 100.0, 0), KeyPoint::new(200.0, 150.0, 1)],
            vec![[0u8; 32], [60u8; 32]],
        )
    }

    fn exchange(robot_id: u32, symbol: char, shared: Arc<SharedState>, transport: Arc<dyn Transport>) -> InterRobotExchange {
        let mut config = LoopClosingConfig::default();
        config.exchange.robot_id = robot_id;
        config.exchange.robot_symbol = symbol;
        InterRobotExchange::new(&config, shared, transport)
    }

    #[test]
    fn test_publish_subscribe_and_dedup() {
        let bus = LoopbackBus::new();
        let (endpoint_a, _rx_a) = bus.connect(0);
        let (endpoint_b, rx_b) = bus.connect(1);

        let shared_a = shared();
        let kf0 = add_keyframe(&shared_a);
        let kf1 = add_keyframe(&shared_a);
        let a = exchange(0, 'a', Arc::clone(&shared_a), Arc::new(endpoint_a));
        let b = exchange(1, 'b', shared(), Arc::new(endpoint_b));

        a.publish_keyframe(kf0).unwrap();
        a.publish_keyframe(kf1).unwrap();
        // Two keyframes plus one odometry measurement.
        let received: Vec<Vec<u8>> = rx_b.try_iter().collect();
        assert_eq!(received.len(), 3);
        assert_eq!(a.stats().published, 2);

        assert!(matches!(
            b.subscribe(&received[0]),
            IngestOutcome::Accepted { robot_id: 0, loop_closure: None, .. }
        ));
        assert!(matches!(b.subscribe(&received[1]), IngestOutcome::Accepted { .. }));
        match b.subscribe(&received[2]) {
            IngestOutcome::Measurement(m) => {
                assert_eq!(m.kind, MeasurementKind::Odometry);
                assert_eq!(m.key1, symbol_key('a', kf0.0));
                assert_eq!(m.key2, symbol_key('a', kf1.0));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        // Re-delivery is idempotent.
        assert!(matches!(
            b.subscribe(&received[1]),
            IngestOutcome::Dropped(DropReason::Duplicate { .. })
        ));
        assert!(matches!(
            b.subscribe(&received[0]),
            IngestOutcome::Dropped(DropReason::OutOfOrder { .. })
        ));
        assert_eq!(b.known_robots(), vec![0]);
        assert_eq!(b.stats().accepted, 2);
        assert_eq!(b.stats().dropped, 2);
    }

    #[test]
    fn test_own_and_malformed_messages_are_dropped() {
        let shared_a = shared();
        let kf = add_keyframe(&shared_a);
        let snapshot = shared_a.map.read().snapshot_keyframe(kf).unwrap();
        let a = exchange(0, 'a', Arc::clone(&shared_a), Arc::new(NullTransport));

        let own = WireFormat::Json
            .encode(&WireMessage::KeyFrame(KeyFrameBundle::from_snapshot(0, 'a', &snapshot)))
            .unwrap();
        assert_eq!(a.subscribe(&own), IngestOutcome::Dropped(DropReason::OwnMessage));

        let mut broken = KeyFrameBundle::from_snapshot(4, 'e', &snapshot);
        broken.keypoints.clear();
        let bytes = WireFormat::Json.encode(&WireMessage::KeyFrame(broken)).unwrap();
        assert!(matches!(a.subscribe(&bytes), IngestOutcome::Dropped(DropReason::Malformed(_))));

        assert!(matches!(
            a.subscribe(b"garbage"),
            IngestOutcome::Dropped(DropReason::Malformed(_))
        ));
        assert!(a.known_robots().is_empty());
    }

    #[test]
    fn test_oversized_pyramid_is_dropped_and_stream_continues() {
        let shared_a = shared();
        let kf = add_keyframe(&shared_a);
        let snapshot = shared_a.map.read().snapshot_keyframe(kf).unwrap();
        let b = exchange(1, 'b', shared(), Arc::new(NullTransport));

        let mut hostile = KeyFrameBundle::from_snapshot(0, 'a', &snapshot);
        hostile.keyframe.n_levels = u32::MAX;
        let bytes = WireFormat::Json.encode(&WireMessage::KeyFrame(hostile)).unwrap();
        assert!(matches!(b.subscribe(&bytes), IngestOutcome::Dropped(DropReason::Malformed(_))));
        assert!(b.known_robots().is_empty());

        let valid = WireFormat::Json
            .encode(&WireMessage::KeyFrame(KeyFrameBundle::from_snapshot(0, 'a', &snapshot)))
            .unwrap();
        assert!(matches!(b.subscribe(&valid), IngestOutcome::Accepted { robot_id: 0, .. }));
    }

    #[test]
    fn test_unknown_keyframe_cannot_be_published() {
        let a = exchange(0, 'a', shared(), Arc::new(NullTransport));
        let err = a.publish_keyframe(KeyFrameId::new(9)).unwrap_err();
        assert!(matches!(err, LoopClosingError::UnknownKeyFrame(_)));
    }
}
