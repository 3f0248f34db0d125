//! User classes, occurrence maps, and lifecycle state enums.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A declared class of simulated users, immutable for the duration of a run.
///
/// Classes are identified by their unique name; the weight expresses the
/// desired share of the total user count relative to the other classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserClass {
    pub name: String,
    pub weight: f64,
}

impl UserClass {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Class name → number of running (or desired) instances.
///
/// A `BTreeMap` so that any iteration that affects computed output is
/// name-ordered and therefore reproducible across runs.
pub type OccurrenceMap = BTreeMap<String, u64>;

/// Sum of all occurrences in a map.
pub fn total_occurrences(map: &OccurrenceMap) -> u64 {
    map.values().sum()
}

/// Return a copy of `map` with a (possibly zero) entry for every declared
/// class.
///
/// Computations that are supposed to be "complete" must carry every class
/// name as a key, never omitting zero-valued entries.
pub fn complete_map(classes: &[UserClass], map: &OccurrenceMap) -> OccurrenceMap {
    let mut out = OccurrenceMap::new();
    for class in classes {
        out.insert(
            class.name.clone(),
            map.get(&class.name).copied().unwrap_or(0),
        );
    }
    out
}

/// Lifecycle of a runner (local or fleet-wide aggregate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Init,
    Spawning,
    Running,
    Cleanup,
    Stopping,
    Stopped,
}

impl RunnerState {
    /// Whether a `start()` call may transition straight into spawning.
    pub fn can_spawn(self) -> bool {
        !matches!(self, RunnerState::Cleanup | RunnerState::Stopping)
    }
}

/// State of a worker as seen by the master.
///
/// `Missing` is entered when the heartbeat liveness counter reaches zero;
/// a later heartbeat self-heals the worker back to its reported state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Ready,
    Spawning,
    Running,
    Stopping,
    Stopped,
    Missing,
}

impl WorkerState {
    /// Workers in these states count toward the dispatchable fleet.
    pub fn accepts_work(self) -> bool {
        matches!(
            self,
            WorkerState::Ready | WorkerState::Spawning | WorkerState::Running
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_map_fills_missing_classes_with_zero() {
        let classes = vec![UserClass::new("a", 1.0), UserClass::new("b", 2.0)];
        let mut partial = OccurrenceMap::new();
        partial.insert("b".to_string(), 3);

        let full = complete_map(&classes, &partial);
        assert_eq!(full.get("a"), Some(&0));
        assert_eq!(full.get("b"), Some(&3));
        assert_eq!(full.len(), 2);
    }

    #[test]
    fn total_occurrences_sums_values() {
        let mut map = OccurrenceMap::new();
        map.insert("a".to_string(), 2);
        map.insert("b".to_string(), 5);
        assert_eq!(total_occurrences(&map), 7);
    }

    #[test]
    fn accepts_work_excludes_terminal_states() {
        assert!(WorkerState::Ready.accepts_work());
        assert!(WorkerState::Spawning.accepts_work());
        assert!(WorkerState::Running.accepts_work());
        assert!(!WorkerState::Stopping.accepts_work());
        assert!(!WorkerState::Stopped.accepts_work());
        assert!(!WorkerState::Missing.accepts_work());
    }

    #[test]
    fn runner_state_serializes_snake_case() {
        let json = serde_json::to_string(&RunnerState::Spawning).unwrap();
        assert_eq!(json, "\"spawning\"");
    }
}
