//! Deduplicated exception records.
//!
//! User-instance errors are keyed by a digest of their traceback so the
//! same failure raised thousands of times across the fleet collapses to
//! one record with a count and the set of contributing nodes.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

/// One deduplicated exception, aggregated across occurrences.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionRecord {
    pub msg: String,
    pub traceback: String,
    pub count: u64,
    /// Node ids that reported this exception at least once.
    pub nodes: BTreeSet<String>,
}

/// Exception table keyed by traceback digest.
#[derive(Debug, Default)]
pub struct ExceptionTable {
    records: BTreeMap<String, ExceptionRecord>,
}

/// Deduplication key for a traceback: a truncated sha256 digest.
pub fn traceback_key(traceback: &str) -> String {
    let digest = Sha256::digest(traceback.as_bytes());
    hex::encode(&digest[..8])
}

impl ExceptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of an exception from `node_id`.
    ///
    /// Returns the deduplication key under which it was filed.
    pub fn record(&mut self, node_id: &str, msg: &str, traceback: &str) -> String {
        let key = traceback_key(traceback);
        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| ExceptionRecord {
                msg: msg.to_string(),
                traceback: traceback.to_string(),
                count: 0,
                nodes: BTreeSet::new(),
            });
        record.count += 1;
        record.nodes.insert(node_id.to_string());
        key
    }

    pub fn get(&self, key: &str) -> Option<&ExceptionRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExceptionRecord)> {
        self.records.iter()
    }
}
