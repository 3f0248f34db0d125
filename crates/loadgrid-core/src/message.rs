//! Typed control-channel messages.
//!
//! The master and its workers exchange `Envelope`s over a generic,
//! reliable, in-order channel per peer. The wire encoding is a
//! collaborator concern; this crate only defines the closed set of
//! message types and their payload shapes, decoded at the transport
//! boundary.

use serde::{Deserialize, Serialize};

use crate::types::{OccurrenceMap, WorkerState};

/// A control message together with its sender identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender node id ("master" for the orchestrator).
    pub node_id: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(node_id: impl Into<String>, message: Message) -> Self {
        Self {
            node_id: node_id.into(),
            message,
        }
    }
}

/// The closed set of control messages exchanged between master and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// Worker announces it is connected and idle, ready for a run.
    ClientReady,
    /// Worker has stopped all of its users after a `Stop` instruction.
    ClientStopped,
    /// Periodic worker liveness report.
    Heartbeat(HeartbeatPayload),
    /// Opaque statistics payload, forwarded to the reporting collaborator.
    Stats(serde_json::Value),
    /// Worker has begun applying a spawn instruction.
    Spawning,
    /// Worker has finished applying a spawn instruction.
    SpawningComplete { user_class_occurrences: OccurrenceMap },
    /// Worker is shutting down for good.
    Quit,
    /// A deduplicatable error from a user instance on a worker.
    Exception { msg: String, traceback: String },
    /// Master → worker: ramp to this per-worker occurrence target.
    Spawn(SpawnPayload),
    /// Master → worker: stop all users.
    Stop,
}

/// Payload of a `Spawn` instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnPayload {
    /// Monotonically increasing per master instance. Workers discard
    /// instructions that are not strictly newer than the last applied one.
    pub timestamp: f64,
    /// The worker's complete per-class target.
    pub user_class_occurrences: OccurrenceMap,
    /// Target host override carried as ambient run config.
    pub host: Option<String>,
    /// Per-instance stop timeout in seconds.
    pub stop_timeout: Option<f64>,
}

/// Payload of a worker heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub state: WorkerState,
    pub current_cpu_usage: f64,
    pub user_class_occurrences: OccurrenceMap,
}
