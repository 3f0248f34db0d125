//! LoadGrid dispatch — the pure scheduling algorithms.
//!
//! Two pieces, both free of I/O and state beyond their inputs:
//!
//! - [`weight_users`] turns declared class weights and a total user count
//!   into an exact integer occurrence map.
//! - [`DispatchPlan`] turns the current per-worker state and a fleet-wide
//!   target into a lazy sequence of per-worker assignments that ramps to
//!   the target without exceeding the spawn rate.

pub mod planner;
pub mod weight;

pub use planner::{CONTROL_INTERVAL, DispatchPlan, DispatchSnapshot, WorkerSlot};
pub use weight::weight_users;
