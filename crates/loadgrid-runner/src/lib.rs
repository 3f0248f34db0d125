//! LoadGrid runner — the local control loop.
//!
//! A [`LocalRunner`] owns the set of live user instances on one process:
//! it spawns and stops instances by class-occurrence delta, tracks
//! aggregate counts, and drives the runner state machine. What each user
//! does per tick is a collaborator concern behind the [`User`] trait.

pub mod error;
pub mod monitor;
pub mod registry;
pub mod runner;
pub mod user;

pub use error::{RunnerError, RunnerResult};
pub use monitor::{CpuMonitor, CpuReading, CpuSampler, ProcStatSampler};
pub use runner::{LocalRunner, RunnerConfig, UserErrorReport};
pub use user::{TaskError, TickFuture, User, UserFactory};
