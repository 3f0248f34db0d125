//! Instance registry — live user instances grouped by class.
//!
//! Owned and mutated exclusively by the runner; per-class vectors keep
//! start order so stop selection can take the most-recently-started
//! instances first.

use std::collections::BTreeMap;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use loadgrid_core::OccurrenceMap;

/// Handle to one running user instance task.
#[derive(Debug)]
pub struct InstanceHandle {
    pub id: u64,
    pub class_name: String,
    /// Graceful-stop signal; the instance finishes its current unit of
    /// work after this flips to true.
    pub stop_tx: watch::Sender<bool>,
    pub join: JoinHandle<()>,
}

/// Live instances, grouped by class in start order.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    next_id: u64,
    by_class: BTreeMap<String, Vec<InstanceHandle>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn register(&mut self, handle: InstanceHandle) {
        self.by_class
            .entry(handle.class_name.clone())
            .or_default()
            .push(handle);
    }

    /// Take up to `count` of the most-recently-started instances of a class.
    pub fn take_newest(&mut self, class_name: &str, count: u64) -> Vec<InstanceHandle> {
        let Some(handles) = self.by_class.get_mut(class_name) else {
            return Vec::new();
        };
        let take = (count as usize).min(handles.len());
        let taken = handles.split_off(handles.len() - take);
        if handles.is_empty() {
            self.by_class.remove(class_name);
        }
        taken
    }

    /// Take every registered instance.
    pub fn take_all(&mut self) -> Vec<InstanceHandle> {
        let mut all = Vec::new();
        for (_, mut handles) in std::mem::take(&mut self.by_class) {
            all.append(&mut handles);
        }
        all
    }

    /// Total live instances.
    pub fn total(&self) -> u64 {
        self.by_class.values().map(|v| v.len() as u64).sum()
    }

    /// Live instances per class (only classes with at least one instance).
    pub fn occurrences(&self) -> OccurrenceMap {
        self.by_class
            .iter()
            .map(|(name, handles)| (name.clone(), handles.len() as u64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle(registry: &mut InstanceRegistry, class: &str) -> u64 {
        let id = registry.allocate_id();
        let (stop_tx, _stop_rx) = watch::channel(false);
        let join = tokio::spawn(async {});
        registry.register(InstanceHandle {
            id,
            class_name: class.to_string(),
            stop_tx,
            join,
        });
        id
    }

    #[tokio::test]
    async fn take_newest_returns_most_recent_first_registered_last() {
        let mut registry = InstanceRegistry::new();
        let _first = dummy_handle(&mut registry, "a");
        let second = dummy_handle(&mut registry, "a");
        let third = dummy_handle(&mut registry, "a");

        let taken = registry.take_newest("a", 2);
        let ids: Vec<u64> = taken.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![second, third]);
        assert_eq!(registry.total(), 1);
        assert_eq!(registry.occurrences().get("a"), Some(&1));
    }

    #[tokio::test]
    async fn take_newest_caps_at_available() {
        let mut registry = InstanceRegistry::new();
        dummy_handle(&mut registry, "a");

        let taken = registry.take_newest("a", 5);
        assert_eq!(taken.len(), 1);
        assert_eq!(registry.total(), 0);
        assert!(registry.occurrences().is_empty());
    }

    #[tokio::test]
    async fn occurrences_group_by_class() {
        let mut registry = InstanceRegistry::new();
        dummy_handle(&mut registry, "a");
        dummy_handle(&mut registry, "b");
        dummy_handle(&mut registry, "b");

        let occurrences = registry.occurrences();
        assert_eq!(occurrences.get("a"), Some(&1));
        assert_eq!(occurrences.get("b"), Some(&2));
        assert_eq!(registry.total(), 3);
    }

    #[tokio::test]
    async fn take_all_empties_registry() {
        let mut registry = InstanceRegistry::new();
        dummy_handle(&mut registry, "a");
        dummy_handle(&mut registry, "b");

        assert_eq!(registry.take_all().len(), 2);
        assert_eq!(registry.total(), 0);
    }
}
