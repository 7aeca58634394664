//! Named, monotonically increasing job counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

pub const MAP_INPUT_RECORDS: &str = "MAP_INPUT_RECORDS";
pub const MAP_OUTPUT_RECORDS: &str = "MAP_OUTPUT_RECORDS";
pub const MALFORMED_INPUT: &str = "MALFORMED_INPUT";
pub const COMBINE_INPUT_RECORDS: &str = "COMBINE_INPUT_RECORDS";
pub const COMBINE_OUTPUT_RECORDS: &str = "COMBINE_OUTPUT_RECORDS";
pub const REDUCE_INPUT_GROUPS: &str = "REDUCE_INPUT_GROUPS";
pub const REDUCE_INPUT_RECORDS: &str = "REDUCE_INPUT_RECORDS";
pub const REDUCE_OUTPUT_RECORDS: &str = "REDUCE_OUTPUT_RECORDS";
pub const REDUCE_FAILED_KEYS: &str = "REDUCE_FAILED_KEYS";
pub const BYTES_READ: &str = "BYTES_READ";
pub const BYTES_WRITTEN: &str = "BYTES_WRITTEN";

/// A cheaply cloneable counter set. Clones share the same values.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    inner: Arc<DashMap<String, AtomicU64>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str, by: u64) {
        if let Some(counter) = self.inner.get(name) {
            counter.fetch_add(by, Ordering::Relaxed);
            return;
        }
        self.inner
            .entry(name.to_string())
            .or_default()
            .fetch_add(by, Ordering::Relaxed);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.inner
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Add every counter of `other` into this set.
    pub fn merge(&self, other: &Counters) {
        for (name, value) in other.snapshot() {
            self.incr(&name, value);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}
