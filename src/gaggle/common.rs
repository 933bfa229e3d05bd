//! Messages exchanged between the Master and its Workers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::engine::RunSpec;
use crate::metrics::StatsAggregator;
use crate::runner::RunState;
use crate::FlockError;

/// Constant defining Flock's default port when running a Gaggle.
pub(crate) const DEFAULT_GAGGLE_PORT: u16 = 5115;

/// Constant defining Flock's default master_host when running a Gaggle.
pub(crate) const DEFAULT_GAGGLE_HOST: &str = "127.0.0.1";

/// Constant defining the host a Master listens on by default.
pub(crate) const DEFAULT_MASTER_BIND_HOST: &str = "0.0.0.0";

/// Milliseconds between Worker heartbeats.
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: usize = 1_000;

/// Heartbeats a Worker can miss before it's considered missing.
pub(crate) const DEFAULT_HEARTBEAT_LIVENESS: usize = 3;

/// Milliseconds between Worker stats reports.
pub(crate) const DEFAULT_REPORT_INTERVAL: usize = 3_000;

/// Every kind of message in a Gaggle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Worker to Master: register, or re-register after a reconnect.
    ClientReady,
    /// Master to Worker: run this many users.
    Spawn,
    /// Master to Worker: stop all users.
    Stop,
    /// Either way: shut down.
    Quit,
    /// Worker to Master: still alive.
    Heartbeat,
    /// Worker to Master: stats recorded since the last report.
    Stats,
    /// Worker to Master: a task failed.
    Exception,
    /// Master to Worker: you aren't registered, stop and register again.
    Reconnect,
}

/// The wire format of every message: a tagged record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub sender_id: String,
    /// Increases by one with every message from the same sender.
    pub sequence_number: u64,
    pub payload: serde_json::Value,
}
impl Envelope {
    pub fn to_json(&self) -> Result<String, FlockError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Envelope, FlockError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode the payload of a message.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, FlockError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Builds envelopes for one sender, numbering them in order.
#[derive(Debug)]
pub(crate) struct Sequencer {
    sender_id: String,
    last_sequence_number: u64,
}
impl Sequencer {
    pub(crate) fn new(sender_id: &str) -> Self {
        Sequencer {
            sender_id: sender_id.to_string(),
            last_sequence_number: 0,
        }
    }

    pub(crate) fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub(crate) fn envelope<P: Serialize>(
        &mut self,
        kind: MessageKind,
        payload: &P,
    ) -> Result<Envelope, FlockError> {
        self.last_sequence_number += 1;
        Ok(Envelope {
            kind,
            sender_id: self.sender_id.clone(),
            sequence_number: self.last_sequence_number,
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// Remembers the last sequence number seen from each sender.
#[derive(Debug, Default)]
pub(crate) struct SequenceTracker {
    last_seen: HashMap<String, u64>,
}
impl SequenceTracker {
    /// Returns true if the message is newer than anything seen from its sender. Replays
    /// and out of order messages return false and should be dropped.
    pub(crate) fn accept(&mut self, envelope: &Envelope) -> bool {
        match self.last_seen.get(&envelope.sender_id) {
            Some(last) if envelope.sequence_number <= *last => false,
            _ => {
                self.last_seen
                    .insert(envelope.sender_id.clone(), envelope.sequence_number);
                true
            }
        }
    }
}

/// The state of a Worker as tracked by the Master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered and not running users.
    Ready,
    /// Spawning or running users.
    Running,
    /// Not heard from within the heartbeat timeout.
    Missing,
}

/// Payload of [`MessageKind::Spawn`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpawnPayload {
    /// Users this Worker should run.
    pub target_count: usize,
    /// Users per second this Worker should launch.
    pub ramp_rate: f32,
    pub run_spec: RunSpec,
}

/// How a Worker process is doing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessHealth {
    /// Seconds since the Worker started.
    pub uptime: u64,
    /// Users told to stop that haven't exited yet.
    pub stopping_users: usize,
    /// Set when the Worker can't reach its target.
    pub warning: Option<String>,
}

/// Payload of [`MessageKind::Heartbeat`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub state: RunState,
    /// Users the Worker was last told to run.
    pub target_count: usize,
    pub user_count: usize,
    pub health: ProcessHealth,
}

/// Payload of [`MessageKind::Stats`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsPayload {
    /// Everything recorded since the previous report, plus the current rate window.
    pub stats: StatsAggregator,
    pub user_count: usize,
    pub user_counts: BTreeMap<String, usize>,
    pub state: RunState,
    pub target_count: usize,
}

/// Payload of [`MessageKind::Exception`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub user_spec: String,
    pub task: String,
    pub error: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_format() {
        let mut sequencer = Sequencer::new("worker_a");
        let envelope = sequencer
            .envelope(
                MessageKind::Heartbeat,
                &HeartbeatPayload {
                    state: RunState::Running,
                    target_count: 5,
                    user_count: 5,
                    health: ProcessHealth::default(),
                },
            )
            .unwrap();
        let json = envelope.to_json().unwrap();
        assert!(json.contains(r#""kind":"heartbeat""#));
        assert!(json.contains(r#""state":"running""#));
        assert!(json.contains(r#""sequence_number":1"#));

        let decoded = Envelope::from_json(&json).unwrap();
        assert_eq!(decoded, envelope);
        let payload: HeartbeatPayload = decoded.payload().unwrap();
        assert_eq!(payload.user_count, 5);

        // Payloads of the wrong shape are errors, not panics.
        assert!(decoded.payload::<SpawnPayload>().is_err());
        assert!(Envelope::from_json("{\"kind\":\"dance\"}").is_err());
    }

    #[test]
    fn messages_without_payload() {
        let mut sequencer = Sequencer::new("master");
        let stop = sequencer.envelope(MessageKind::Stop, &()).unwrap();
        assert_eq!(stop.payload, serde_json::Value::Null);
        assert_eq!(stop.sequence_number, 1);
        let quit = sequencer.envelope(MessageKind::Quit, &()).unwrap();
        assert_eq!(quit.sequence_number, 2);
        assert_eq!(sequencer.sender_id(), "master");
    }

    #[test]
    fn replays_are_dropped() {
        let mut a = Sequencer::new("a");
        let mut b = Sequencer::new("b");
        let mut tracker = SequenceTracker::default();

        let a1 = a.envelope(MessageKind::ClientReady, &()).unwrap();
        let a2 = a.envelope(MessageKind::Heartbeat, &()).unwrap();
        let b1 = b.envelope(MessageKind::ClientReady, &()).unwrap();

        assert!(tracker.accept(&a1));
        assert!(tracker.accept(&a2));
        // The same message twice, or an older one, is dropped.
        assert!(!tracker.accept(&a2));
        assert!(!tracker.accept(&a1));
        // Senders are tracked independently.
        assert!(tracker.accept(&b1));
    }
}
