//! Splits the job input into partitions of line records.

use std::fmt;

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use common::storage::{Entry, SharedStorage};
use common::utils::split_records;
use common::{JobId, Record};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PartitionId {
    pub job: JobId,
    pub index: u32,
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p{}", self.job, self.index)
    }
}

/// A contiguous slice of the input. Every record belongs to exactly one partition.
#[derive(Clone, Debug)]
pub struct Partition {
    pub id: PartitionId,
    pub records: Vec<Record>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Files whose name starts with `_` or `.` are bookkeeping, not input.
fn is_hidden(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.starts_with('_') || name.starts_with('.')
}

pub struct PartitionReader {
    storage: SharedStorage,
    input: String,
}

impl PartitionReader {
    pub fn new(storage: SharedStorage, input: impl Into<String>) -> Self {
        Self {
            storage,
            input: input.into(),
        }
    }

    /// The input files in the order their records are numbered.
    pub async fn input_files(&self) -> Result<Vec<Entry>> {
        if !self.storage.exists(&self.input).await? {
            return Err(anyhow!("input path `{}` does not exist", self.input));
        }
        let mut files: Vec<Entry> = self
            .storage
            .list(&self.input)
            .await?
            .into_iter()
            .filter(|e| !e.is_dir && !is_hidden(&e.path))
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Every record of the input, file by file. Also returns the bytes read.
    pub async fn read_records(&self) -> Result<(Vec<Record>, u64)> {
        let mut records = Vec::new();
        let mut bytes_read = 0u64;
        for file in self.input_files().await? {
            let data = self.storage.open(&file.path).await?;
            bytes_read += data.len() as u64;
            let before = records.len();
            records.extend(split_records(&data));
            debug!(
                "read {} records from `{}`",
                records.len() - before,
                file.path
            );
        }
        Ok((records, bytes_read))
    }

    /// Read the input and split it into `count` partitions of near-equal size.
    /// Some partitions are empty when there are fewer records than partitions.
    pub async fn partitions(&self, job: JobId, count: u32) -> Result<(Vec<Partition>, u64)> {
        let (records, bytes_read) = self.read_records().await?;
        info!(
            "Splitting {} records from `{}` into {} partitions",
            records.len(),
            self.input,
            count
        );
        let partitions = split_even(records, count)
            .into_iter()
            .enumerate()
            .map(|(index, records)| Partition {
                id: PartitionId {
                    job,
                    index: index as u32,
                },
                records,
            })
            .collect();
        Ok((partitions, bytes_read))
    }
}

/// Partition `i` of `count` gets records `[i*n/count, (i+1)*n/count)`.
pub fn split_even(records: Vec<Record>, count: u32) -> Vec<Vec<Record>> {
    let count = count.max(1) as usize;
    let n = records.len();
    let mut out = Vec::with_capacity(count);
    let mut iter = records.into_iter();
    for i in 0..count {
        let take = (i + 1) * n / count - i * n / count;
        out.push(iter.by_ref().take(take).collect());
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use common::storage::{CreateOptions, MemoryStorage, Storage};

    use super::*;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new(i as u64, Bytes::from(i.to_string())))
            .collect()
    }

    #[test]
    fn split_covers_every_record_once() {
        for (n, p) in [(10, 3), (3, 10), (0, 4), (1000, 7)] {
            let parts = split_even(records(n), p);
            assert_eq!(parts.len(), p as usize);
            let flat: Vec<Record> = parts.iter().flatten().cloned().collect();
            assert_eq!(flat, records(n));
            let max = parts.iter().map(Vec::len).max().unwrap_or(0);
            let min = parts.iter().map(Vec::len).min().unwrap_or(0);
            assert!(max - min <= 1);
        }
    }

    #[tokio::test]
    async fn reads_directory_in_path_order() {
        let storage = MemoryStorage::new();
        for (path, data) in [
            ("in/b.txt", "three\n"),
            ("in/a.txt", "one\ntwo\n"),
            ("in/_SUCCESS", ""),
        ] {
            storage
                .create(path, CreateOptions::default(), Bytes::from(data))
                .await
                .unwrap();
        }
        let reader = PartitionReader::new(Arc::new(storage), "in");
        let (parts, bytes) = reader.partitions(JobId::new(1, 1), 2).await.unwrap();
        assert_eq!(bytes, 14);
        let lines: Vec<Vec<Bytes>> = parts
            .iter()
            .map(|p| p.records.iter().map(|r| r.line.clone()).collect())
            .collect();
        assert_eq!(
            lines,
            vec![
                vec![Bytes::from("one")],
                vec![Bytes::from("two"), Bytes::from("three")]
            ]
        );
        assert_eq!(parts[1].id.to_string(), "job_1_0001/p1");
    }

    #[tokio::test]
    async fn missing_input_is_an_error() {
        let reader = PartitionReader::new(Arc::new(MemoryStorage::new()), "nowhere");
        assert!(reader.partitions(JobId::new(1, 1), 1).await.is_err());
    }
}
