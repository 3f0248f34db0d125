//! LoadGrid cluster — running a load test across a fleet of workers.
//!
//! The [`Master`] owns the fleet view: it registers workers, watches
//! their heartbeats, computes per-worker spawn instructions, and
//! aggregates reported counts. Each [`WorkerAgent`] applies instructions
//! to its local runner and reports back. The two sides talk through the
//! transport-agnostic channel traits in [`transport`]; an in-process
//! implementation backs tests and single-machine runs.

pub mod config;
pub mod error;
pub mod master;
pub mod node;
pub mod transport;
pub mod worker;

pub use config::ClusterConfig;
pub use error::{ClusterError, ClusterResult};
pub use master::{Master, MasterCommand};
pub use node::WorkerNode;
pub use transport::{
    FleetSender, InProcGrid, MessageReceiver, TransportError, WorkerReceiver, WorkerSender,
};
pub use worker::WorkerAgent;
