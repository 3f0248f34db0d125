//! Worker records as seen by the master.

use loadgrid_core::{OccurrenceMap, WorkerState, total_occurrences};

/// The master's view of one worker.
///
/// Created when the worker announces `client_ready`, removed on
/// `client_stopped`/`quit`. Liveness is a decrementing counter: the
/// supervision tick takes one per interval, a heartbeat resets it to the
/// configured maximum. At zero the worker is declared missing; a later
/// heartbeat self-heals it to the state carried in that heartbeat.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    pub id: String,
    pub state: WorkerState,
    pub heartbeat_liveness: u32,
    pub cpu_usage: f64,
    pub user_class_occurrences: OccurrenceMap,
}

impl WorkerNode {
    pub fn new(id: impl Into<String>, liveness: u32) -> Self {
        Self {
            id: id.into(),
            state: WorkerState::Ready,
            heartbeat_liveness: liveness,
            cpu_usage: 0.0,
            user_class_occurrences: OccurrenceMap::new(),
        }
    }

    /// Users this worker currently reports.
    pub fn user_count(&self) -> u64 {
        total_occurrences(&self.user_class_occurrences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_starts_ready_with_full_liveness() {
        let node = WorkerNode::new("worker-1", 3);
        assert_eq!(node.state, WorkerState::Ready);
        assert_eq!(node.heartbeat_liveness, 3);
        assert_eq!(node.user_count(), 0);
    }

    #[test]
    fn user_count_sums_occurrences() {
        let mut node = WorkerNode::new("worker-1", 3);
        node.user_class_occurrences.insert("a".to_string(), 4);
        node.user_class_occurrences.insert("b".to_string(), 6);
        assert_eq!(node.user_count(), 10);
    }
}
