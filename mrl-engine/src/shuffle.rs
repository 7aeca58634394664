//! Routing intermediate pairs to reduce groups, and moving them from the map
//! side to the reduce side through storage.
//!
//! Map task `m` writes one file per group, `mr-{m}-{g}`, even when it has no
//! pairs for `g`. A reduce group may only be fetched once every map file for
//! it is present.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::debug;

use common::codec::{decode_pairs, encode_pairs};
use common::storage::{join, CreateOptions, SharedStorage};
use common::{ihash, Error, KeyValue, Result};

/// Decides which reduce group owns a key.
pub trait Partitioner: Send + Sync {
    fn num_groups(&self) -> u32;

    /// Must be deterministic: equal keys always land in the same group.
    fn partition_of(&self, key: &[u8]) -> u32;
}

#[derive(Clone, Copy, Debug)]
pub struct HashPartitioner {
    groups: u32,
}

impl HashPartitioner {
    pub fn new(groups: u32) -> Result<Self> {
        if groups == 0 {
            return Err(Error::InvalidPlan(
                "a hash partitioner needs at least one group".into(),
            ));
        }
        Ok(Self { groups })
    }
}

impl Partitioner for HashPartitioner {
    fn num_groups(&self) -> u32 {
        self.groups
    }

    fn partition_of(&self, key: &[u8]) -> u32 {
        ihash(key) % self.groups
    }
}

/// Split pairs into one bucket per group.
pub fn bucket_pairs(pairs: Vec<KeyValue>, partitioner: &dyn Partitioner) -> Vec<Vec<KeyValue>> {
    let mut buckets = vec![Vec::new(); partitioner.num_groups() as usize];
    for kv in pairs {
        buckets[partitioner.partition_of(&kv.key) as usize].push(kv);
    }
    buckets
}

pub fn intermediate_path(dir: &str, map: u32, group: u32) -> String {
    join(dir, &format!("mr-{map}-{group}"))
}

pub struct ShuffleWriter {
    storage: SharedStorage,
    dir: String,
}

impl ShuffleWriter {
    pub fn new(storage: SharedStorage, dir: impl Into<String>) -> Self {
        Self {
            storage,
            dir: dir.into(),
        }
    }

    /// Write every bucket of one map task. A retried attempt replaces the
    /// files of the earlier one. Returns the number of bytes written.
    pub async fn write(&self, map: u32, buckets: &[Vec<KeyValue>]) -> Result<u64> {
        let mut written = 0u64;
        for (group, pairs) in buckets.iter().enumerate() {
            let path = intermediate_path(&self.dir, map, group as u32);
            let data = encode_pairs(pairs);
            written += data.len() as u64;
            self.storage
                .create(&path, CreateOptions::overwrite(), data)
                .await
                .map_err(Error::Storage)?;
        }
        debug!("map {map} wrote {} shuffle files", buckets.len());
        Ok(written)
    }
}

/// All values for one key, as the reduce function sees them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyGroup {
    pub key: Bytes,
    pub values: Vec<Bytes>,
}

pub struct ShuffleReader {
    storage: SharedStorage,
    dir: String,
    map_count: u32,
}

impl ShuffleReader {
    pub fn new(storage: SharedStorage, dir: impl Into<String>, map_count: u32) -> Self {
        Self {
            storage,
            dir: dir.into(),
            map_count,
        }
    }

    /// Gather group `group` from every map task, grouped and ordered by key.
    /// Returns the bytes read as well.
    pub async fn fetch_group(&self, group: u32) -> Result<(Vec<KeyGroup>, u64)> {
        let mut grouped: BTreeMap<Bytes, Vec<Bytes>> = BTreeMap::new();
        let mut bytes_read = 0u64;

        for map in 0..self.map_count {
            let path = intermediate_path(&self.dir, map, group);
            if !self.storage.exists(&path).await.map_err(Error::Storage)? {
                return Err(Error::task(
                    format!("shuffle-{group}"),
                    format!("map output `{path}` is missing"),
                ));
            }
            let data = self.storage.open(&path).await.map_err(Error::Storage)?;
            bytes_read += data.len() as u64;
            let pairs = decode_pairs(&data)
                .map_err(|e| Error::task(format!("shuffle-{group}"), format!("{path}: {e}")))?;
            for kv in pairs {
                grouped.entry(kv.key).or_default().push(kv.value);
            }
        }

        let groups = grouped
            .into_iter()
            .map(|(key, values)| KeyGroup { key, values })
            .collect();
        Ok((groups, bytes_read))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::storage::MemoryStorage;

    use super::*;

    #[test]
    fn equal_keys_share_a_group() {
        let partitioner = HashPartitioner::new(7).unwrap();
        for key in [&b"alpha"[..], b"beta", b"", b"gamma"] {
            let g = partitioner.partition_of(key);
            assert!(g < 7);
            assert_eq!(g, partitioner.partition_of(key));
        }
    }

    #[test]
    fn zero_groups_is_rejected() {
        assert!(matches!(
            HashPartitioner::new(0),
            Err(Error::InvalidPlan(_))
        ));
    }

    #[test]
    fn buckets_hold_every_pair() {
        let pairs: Vec<KeyValue> = (0..50)
            .map(|i| KeyValue::new(format!("k{}", i % 10), "1"))
            .collect();
        let partitioner = HashPartitioner::new(3).unwrap();
        let buckets = bucket_pairs(pairs, &partitioner);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets.iter().map(Vec::len).sum::<usize>(), 50);
        for (g, bucket) in buckets.iter().enumerate() {
            assert!(bucket
                .iter()
                .all(|kv| partitioner.partition_of(&kv.key) == g as u32));
        }
    }

    #[tokio::test]
    async fn reader_groups_across_maps() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        let writer = ShuffleWriter::new(storage.clone(), "tmp");
        writer
            .write(0, &[vec![KeyValue::new("b", "1"), KeyValue::new("a", "1")]])
            .await
            .unwrap();
        writer
            .write(1, &[vec![KeyValue::new("a", "2")]])
            .await
            .unwrap();

        let reader = ShuffleReader::new(storage, "tmp", 2);
        let (groups, _) = reader.fetch_group(0).await.unwrap();
        assert_eq!(
            groups,
            vec![
                KeyGroup {
                    key: Bytes::from("a"),
                    values: vec![Bytes::from("1"), Bytes::from("2")]
                },
                KeyGroup {
                    key: Bytes::from("b"),
                    values: vec![Bytes::from("1")]
                },
            ]
        );
    }

    #[tokio::test]
    async fn reader_refuses_before_every_map_wrote() {
        let storage: SharedStorage = Arc::new(MemoryStorage::new());
        ShuffleWriter::new(storage.clone(), "tmp")
            .write(0, &[vec![]])
            .await
            .unwrap();
        let reader = ShuffleReader::new(storage, "tmp", 2);
        assert!(matches!(
            reader.fetch_group(0).await,
            Err(Error::TaskExecution { .. })
        ));
    }
}
