//! Shared types for the map-reduce-lite execution core.
//!
//! Users pick a map/combine/reduce application, the coordinator turns it into a
//! job plan and hands it to a cluster scheduler, and workers run the plan over
//! partitioned input kept behind a [`storage::Storage`] implementation.

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod counters;
pub mod error;
pub mod minio;
pub mod storage;
pub mod task;
pub mod utils;

pub use counters::Counters;
pub use error::{Error, Result};
pub use task::TaskContext;

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// The output of an application map function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for records that cannot be parsed at all.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) map operations.
pub type MapOutput = anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<KeyValue>>>>;

/// A map function takes one input record and the task context.
///
/// It returns an iterator that yields intermediate key-value pairs.
pub type MapFn = fn(record: Record, ctx: &TaskContext) -> MapOutput;

/// A combine function folds the values a single map task produced for one
/// key into a single value of the same type.
pub type CombineFn = fn(
    key: &Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    ctx: &TaskContext,
) -> anyhow::Result<Bytes>;

/// A reduce function takes in a key, an iterator over every value for that key,
/// and the task context. It returns zero or more output records.
pub type ReduceFn = fn(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    ctx: &TaskContext,
) -> anyhow::Result<Vec<KeyValue>>;

/// Runs once per task, before the first record or after the last one.
pub type HookFn = fn(ctx: &TaskContext) -> anyhow::Result<()>;

/// A map reduce application.
#[derive(Copy, Clone)]
pub struct Workload {
    pub name: &'static str,
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,

    /// Local pre-aggregation. Only ever applied when `reduce_associative` holds.
    pub combine_fn: Option<CombineFn>,

    pub setup_fn: Option<HookFn>,
    pub cleanup_fn: Option<HookFn>,

    /// Declared by the application: the reduce operation is associative and
    /// commutative over its value type, so it may run zero or more times
    /// on partial inputs.
    pub reduce_associative: bool,
}

impl fmt::Debug for Workload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workload")
            .field("name", &self.name)
            .field("combiner", &self.combine_fn.is_some())
            .field("reduce_associative", &self.reduce_associative)
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
// Records and key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// One unit of input: a line and its byte offset inside the object it was read from.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Record {
    pub offset: u64,
    pub line: Bytes,
}

impl Record {
    pub fn new(offset: u64, line: Bytes) -> Self {
        Self { offset, line }
    }
}

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,

    /// The value.
    pub value: Bytes,
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}",
            String::from_utf8_lossy(&self.key),
            String::from_utf8_lossy(&self.value)
        )
    }
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the key of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn key(&self) -> Bytes {
        self.key.clone()
    }

    /// Get the value of this key-value pair.
    ///
    /// This method is cheap, since [`Bytes`] are cheaply cloneable.
    #[inline]
    pub fn value(&self) -> Bytes {
        self.value.clone()
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> Bytes {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> Bytes {
        self.value
    }
}

/// Hashes an intermediate key. Compute a reduce bucket for a given key
/// by calculating `ihash(key) % n_reduce`.
///
/// FNV with a fixed key, so the result is stable across processes and runs.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    (hasher.finish() & 0x7fffffff) as u32
}

/////////////////////////////////////////////////////////////////////////////
// Identifiers and resources
/////////////////////////////////////////////////////////////////////////////

/// Identifier the coordinator allocates for every submitted plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub cluster_timestamp: u64,
    pub sequence: u32,
}

impl JobId {
    pub fn new(cluster_timestamp: u64, sequence: u32) -> Self {
        Self {
            cluster_timestamp,
            sequence,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "job_{}_{:04}", self.cluster_timestamp, self.sequence)
    }
}

/// Memory and virtual cores, either requested by a task or offered by a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub vcores: u32,
}

impl Resource {
    pub const fn new(memory_mb: u64, vcores: u32) -> Self {
        Self { memory_mb, vcores }
    }

    /// Whether `self` can be satisfied out of `available`.
    pub fn fits_within(&self, available: &Resource) -> bool {
        self.memory_mb <= available.memory_mb && self.vcores <= available.vcores
    }

    pub fn saturating_add(&self, other: &Resource) -> Resource {
        Resource {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            vcores: self.vcores.saturating_add(other.vcores),
        }
    }

    pub fn saturating_sub(&self, other: &Resource) -> Resource {
        Resource {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            vcores: self.vcores.saturating_sub(other.vcores),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "<memory:{} MB, vcores:{}>", self.memory_mb, self.vcores)
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihash_is_stable() {
        assert_eq!(ihash(b"hadoop"), ihash(b"hadoop"));
        assert_ne!(ihash(b"hadoop"), ihash(b"yarn"));
        assert!(ihash(b"anything") <= 0x7fffffff);
    }

    #[test]
    fn job_id_display_is_padded() {
        let id = JobId::new(1700000000000, 7);
        assert_eq!(id.to_string(), "job_1700000000000_0007");
    }

    #[test]
    fn resource_fit_and_arithmetic() {
        let small = Resource::new(1024, 1);
        let big = Resource::new(4096, 4);
        assert!(small.fits_within(&big));
        assert!(!big.fits_within(&small));
        assert_eq!(big.saturating_sub(&small), Resource::new(3072, 3));
        assert_eq!(small.saturating_sub(&big), Resource::default());
        assert_eq!(small.saturating_add(&small), Resource::new(2048, 2));
    }

    #[test]
    fn key_value_display_is_lossy() {
        let kv = KeyValue::new("word", "3");
        assert_eq!(kv.to_string(), "word 3");
    }
}
