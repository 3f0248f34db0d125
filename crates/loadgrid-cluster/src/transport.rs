//! Transport abstraction for the control channel.
//!
//! The master and worker loops are written against the traits here and
//! never against a concrete transport. The contract is a reliable,
//! in-order channel per peer: one shared inbox on the master side, one
//! send/receive pair per worker. [`InProcGrid`] is the in-process
//! implementation backing tests and single-machine runs.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;

use loadgrid_core::{Envelope, Message};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer's channel is gone. Senders treat this as a transient
    /// condition and retry after the fallback interval.
    #[error("peer {0} is disconnected")]
    Disconnected(String),

    /// The transport itself has shut down; no retry will succeed.
    #[error("transport closed")]
    Closed,
}

/// Master-side inbox: envelopes from every worker, in per-worker order.
pub trait MessageReceiver: Send {
    /// Receive the next envelope, or `None` once the transport closes.
    fn recv(&mut self) -> BoxFuture<'_, Option<Envelope>>;
}

/// Master-side outbound half: address any worker by node id.
pub trait FleetSender: Send + Sync {
    fn send_to(&self, node_id: &str, message: Message) -> Result<(), TransportError>;
}

/// Worker-side outbound half.
pub trait WorkerSender: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Worker-side inbound half: instructions from the master, in order.
pub trait WorkerReceiver: Send {
    /// Receive the next instruction, or `None` once the master is gone.
    fn recv(&mut self) -> BoxFuture<'_, Option<Message>>;
}

// ── In-process transport ─────────────────────────────────────────────

/// In-process control grid: a registry of per-worker channels plus one
/// shared channel back to the master.
#[derive(Clone)]
pub struct InProcGrid {
    workers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>,
    to_master: mpsc::UnboundedSender<Envelope>,
}

impl InProcGrid {
    /// Create the grid along with the master's inbox.
    pub fn new() -> (Self, MasterInbox) {
        let (to_master, from_workers) = mpsc::unbounded_channel();
        let grid = Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            to_master,
        };
        (grid, MasterInbox { rx: from_workers })
    }

    /// Register a worker and hand back its channel halves.
    pub fn connect(&self, node_id: &str) -> (InProcWorkerSender, InProcWorkerReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.workers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(node_id.to_string(), tx);
        (
            InProcWorkerSender {
                to_master: self.to_master.clone(),
            },
            InProcWorkerReceiver { rx },
        )
    }

    /// Drop a worker's channel, as if its process vanished.
    pub fn disconnect(&self, node_id: &str) {
        self.workers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(node_id);
    }
}

impl FleetSender for InProcGrid {
    fn send_to(&self, node_id: &str, message: Message) -> Result<(), TransportError> {
        let workers = self
            .workers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = workers
            .get(node_id)
            .ok_or_else(|| TransportError::Disconnected(node_id.to_string()))?;
        tx.send(message)
            .map_err(|_| TransportError::Disconnected(node_id.to_string()))
    }
}

pub struct MasterInbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl MessageReceiver for MasterInbox {
    fn recv(&mut self) -> BoxFuture<'_, Option<Envelope>> {
        Box::pin(self.rx.recv())
    }
}

#[derive(Clone)]
pub struct InProcWorkerSender {
    to_master: mpsc::UnboundedSender<Envelope>,
}

impl WorkerSender for InProcWorkerSender {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.to_master.send(envelope).map_err(|_| TransportError::Closed)
    }
}

pub struct InProcWorkerReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl WorkerReceiver for InProcWorkerReceiver {
    fn recv(&mut self) -> BoxFuture<'_, Option<Message>> {
        Box::pin(self.rx.recv())
    }
}
