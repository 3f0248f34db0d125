//! LoadGrid core — shared vocabulary for the orchestration layer.
//!
//! This crate holds the types every other LoadGrid crate speaks:
//! declared user classes, occurrence maps, runner/worker state enums,
//! the typed control-message envelope, the in-process event bus, and
//! the deduplicated exception table.

pub mod events;
pub mod exception;
pub mod message;
pub mod types;

pub use events::{Event, EventBus};
pub use exception::{ExceptionRecord, ExceptionTable, traceback_key};
pub use message::{Envelope, HeartbeatPayload, Message, SpawnPayload};
pub use types::{
    OccurrenceMap, RunnerState, UserClass, WorkerState, complete_map, total_occurrences,
};
