//! Dispatch planning — ramping a fleet from its current state to a target.
//!
//! [`DispatchPlan`] is a lazy, finite, non-restartable iterator over
//! dispatch snapshots. Each snapshot is a complete per-worker occurrence
//! map; consuming the sequence to completion converges the fleet on the
//! target exactly. The iterator itself never sleeps — the consumer paces
//! rate-limited steps at [`CONTROL_INTERVAL`].

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use loadgrid_core::OccurrenceMap;

/// Pacing interval between rate-limited dispatch steps.
pub const CONTROL_INTERVAL: Duration = Duration::from_secs(1);

/// A worker's identity and its currently running per-class counts.
#[derive(Debug, Clone)]
pub struct WorkerSlot {
    pub node_id: String,
    pub occurrences: OccurrenceMap,
}

/// One intermediate assignment: worker id → complete occurrence map.
pub type DispatchSnapshot = BTreeMap<String, OccurrenceMap>;

/// Iterator that closes the gap between the fleet's current state and
/// the target without exceeding the spawn rate.
///
/// Invariants per yielded snapshot:
/// - every worker id maps to a complete occurrence map (every class
///   present, zeros included);
/// - no more than `ceil(spawn_rate * CONTROL_INTERVAL)` instances are
///   started fleet-wide since the previous snapshot;
/// - shrinking is not rate-limited: all excess instances are removed in
///   the first snapshot, taken from the workers holding the most of the
///   shrinking class;
/// - the final snapshot aggregates to the target exactly.
///
/// An empty worker set yields an empty sequence.
pub struct DispatchPlan {
    /// Declared class names, in map (name) order.
    classes: Vec<String>,
    target: OccurrenceMap,
    /// Per-worker state, mutated as the plan progresses.
    current: BTreeMap<String, OccurrenceMap>,
    /// Fleet-wide spawn budget per snapshot.
    per_step: u64,
    shrunk: bool,
    done: bool,
}

impl DispatchPlan {
    pub fn new(workers: &[WorkerSlot], target: OccurrenceMap, spawn_rate: f64) -> Self {
        // Classes a worker still holds but the target no longer names
        // must shrink to zero, so track the union.
        let mut target = target;
        for worker in workers {
            for name in worker.occurrences.keys() {
                target.entry(name.clone()).or_insert(0);
            }
        }
        let classes: Vec<String> = target.keys().cloned().collect();

        let current: BTreeMap<String, OccurrenceMap> = workers
            .iter()
            .map(|w| {
                let mut map = OccurrenceMap::new();
                for name in &classes {
                    map.insert(name.clone(), w.occurrences.get(name).copied().unwrap_or(0));
                }
                (w.node_id.clone(), map)
            })
            .collect();

        let per_step = (spawn_rate.ceil() as u64).max(1);

        Self {
            classes,
            target,
            current,
            per_step,
            shrunk: false,
            done: workers.is_empty(),
        }
    }

    /// Fleet-wide count of a class across all workers.
    fn aggregate(&self, class: &str) -> u64 {
        self.current
            .values()
            .map(|m| m.get(class).copied().unwrap_or(0))
            .sum()
    }

    fn at_target(&self) -> bool {
        self.classes
            .iter()
            .all(|c| self.aggregate(c) == *self.target.get(c).unwrap_or(&0))
    }

    /// Remove all excess instances, preferring the workers that hold the
    /// most of the shrinking class. Not rate-limited.
    fn apply_stops(&mut self) {
        for class in self.classes.clone() {
            let target = *self.target.get(&class).unwrap_or(&0);
            let mut excess = self.aggregate(&class).saturating_sub(target);
            while excess > 0 {
                // Worker holding the most of this class; ties go to the
                // first id in order.
                let victim = self
                    .current
                    .iter()
                    .max_by(|(a_id, a), (b_id, b)| {
                        let a_count = a.get(&class).copied().unwrap_or(0);
                        let b_count = b.get(&class).copied().unwrap_or(0);
                        a_count.cmp(&b_count).then(b_id.cmp(a_id))
                    })
                    .map(|(id, _)| id.clone());
                let Some(victim) = victim else { break };
                if let Some(count) = self.current.get_mut(&victim).and_then(|m| m.get_mut(&class))
                {
                    *count -= 1;
                }
                excess -= 1;
                debug!(worker = %victim, %class, "removing excess instance");
            }
        }
    }

    /// Class with the largest relative deficit against its target share,
    /// so the weight mix is preserved throughout the ramp. Ties break by
    /// name order.
    fn next_class_to_grow(&self) -> Option<String> {
        self.classes
            .iter()
            .filter_map(|class| {
                let target = *self.target.get(class).unwrap_or(&0);
                if target == 0 {
                    return None;
                }
                let have = self.aggregate(class);
                if have >= target {
                    return None;
                }
                Some((class.clone(), (target - have) as f64 / target as f64))
            })
            .max_by(|(a_name, a), (b_name, b)| {
                a.partial_cmp(b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(b_name.cmp(a_name))
            })
            .map(|(name, _)| name)
    }

    /// Worker that should receive the next instance of `class`: fewest of
    /// that class, then fewest users overall, then id order.
    fn next_worker_for(&self, class: &str) -> Option<String> {
        self.current
            .iter()
            .min_by_key(|(id, map)| {
                let of_class = map.get(class).copied().unwrap_or(0);
                let in_total: u64 = map.values().sum();
                (of_class, in_total, (*id).clone())
            })
            .map(|(id, _)| id.clone())
    }
}

impl Iterator for DispatchPlan {
    type Item = DispatchSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if !self.shrunk {
            self.apply_stops();
            self.shrunk = true;
        }

        let mut budget = self.per_step;
        while budget > 0 {
            let Some(class) = self.next_class_to_grow() else {
                break;
            };
            let Some(worker) = self.next_worker_for(&class) else {
                break;
            };
            if let Some(count) = self.current.get_mut(&worker).and_then(|m| m.get_mut(&class)) {
                *count += 1;
            }
            budget -= 1;
        }

        if self.at_target() {
            self.done = true;
        }

        Some(self.current.clone())
    }
}
