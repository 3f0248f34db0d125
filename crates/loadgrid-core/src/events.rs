//! In-process event bus.
//!
//! Collaborators (stats recorders, UI glue, test hooks) subscribe to a
//! closed set of events. Events fire synchronously on the emitting task,
//! in subscription order. A panicking listener is not isolated from the
//! listeners registered after it — that is a programming error, not a
//! runtime condition.

use std::sync::RwLock;

use serde_json::Value;

/// Events emitted by the orchestration core.
#[derive(Debug, Clone)]
pub enum Event {
    /// A run has started (fired on the master and on each worker).
    TestStart,
    /// A run has stopped.
    TestStop,
    /// Every outstanding spawn has completed; carries the fleet user count.
    SpawningComplete { user_count: u64 },
    /// The master received a stats payload from a worker.
    WorkerReport { client_id: String, data: Value },
    /// A worker is about to send a stats payload to the master. The
    /// payload already carries the worker's `user_class_occurrences`.
    ReportToMaster { client_id: String, data: Value },
    /// A user instance raised during its unit of work.
    UserError {
        class_name: String,
        msg: String,
        traceback: String,
    },
    /// A simulated request succeeded (consumed by the stats collaborator).
    RequestSuccess { name: String, response_time_ms: f64 },
    /// A simulated request failed.
    RequestFailure {
        name: String,
        response_time_ms: f64,
        error: String,
    },
    /// The process is shutting down.
    Quitting,
}

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Synchronous listener registry.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners fire in subscription order.
    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("event bus lock poisoned")
            .push(Box::new(listener));
    }

    /// Fire an event to every listener, synchronously.
    pub fn fire(&self, event: &Event) {
        let listeners = self.listeners.read().expect("event bus lock poisoned");
        for listener in listeners.iter() {
            listener(event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.read().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}
