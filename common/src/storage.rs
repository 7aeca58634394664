//! The storage collaborator: the narrow file interface the partition reader,
//! the shuffle and the output sink are written against.
//!
//! Paths are `/`-separated. A "directory" is any prefix that other paths live
//! under; it exists as long as something lives under it.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default)]
pub struct CreateOptions {
    /// Replace an existing file instead of failing.
    pub overwrite: bool,

    /// Advisory replication factor.
    pub replication: Option<u16>,
}

impl CreateOptions {
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            replication: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub path: String,
    pub len: u64,
    pub is_dir: bool,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read a whole file.
    async fn open(&self, path: &str) -> Result<Bytes>;

    /// Write a whole file.
    async fn create(&self, path: &str, options: CreateOptions, data: Bytes) -> Result<()>;

    /// Files directly under `path`, or `path` itself if it names a file.
    /// Sorted by path.
    async fn list(&self, path: &str) -> Result<Vec<Entry>>;

    /// Returns whether anything was deleted. Deleting a non-empty directory
    /// without `recursive` is an error.
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool>;
}

pub type SharedStorage = Arc<dyn Storage>;

/// Join path segments with a single `/`.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

fn dir_prefix(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

#[derive(Clone, Debug)]
struct StoredFile {
    data: Bytes,
    replication: u16,
}

/// Process-local storage. Used by tests and single-process runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    files: Arc<DashMap<String, StoredFile>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replication factor recorded for a file, if it exists.
    pub fn replication(&self, path: &str) -> Option<u16> {
        self.files.get(path).map(|f| f.replication)
    }

    /// Every file path, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn exists(&self, path: &str) -> Result<bool> {
        if self.files.contains_key(path) {
            return Ok(true);
        }
        let prefix = dir_prefix(path);
        Ok(self.files.iter().any(|e| e.key().starts_with(&prefix)))
    }

    async fn open(&self, path: &str) -> Result<Bytes> {
        self.files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| anyhow!("file `{path}` does not exist"))
    }

    async fn create(&self, path: &str, options: CreateOptions, data: Bytes) -> Result<()> {
        if path.is_empty() || path.ends_with('/') {
            return Err(anyhow!("`{path}` is not a file path"));
        }
        let file = StoredFile {
            data,
            replication: options.replication.unwrap_or(1),
        };
        match self.files.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                if !options.overwrite {
                    return Err(anyhow!("file `{path}` already exists"));
                }
                existing.insert(file);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(file);
            }
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<Entry>> {
        if let Some(file) = self.files.get(path) {
            return Ok(vec![Entry {
                path: path.to_string(),
                len: file.data.len() as u64,
                is_dir: false,
            }]);
        }

        let prefix = dir_prefix(path);
        let mut entries: Vec<Entry> = Vec::new();
        for file in self.files.iter() {
            let Some(rest) = file.key().strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => entries.push(Entry {
                    path: file.key().clone(),
                    len: file.data.len() as u64,
                    is_dir: false,
                }),
                Some((child, _)) => {
                    let child = join(&prefix, child);
                    if !entries.iter().any(|e| e.path == child) {
                        entries.push(Entry {
                            path: child,
                            len: 0,
                            is_dir: true,
                        });
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<bool> {
        if self.files.remove(path).is_some() {
            return Ok(true);
        }
        let prefix = dir_prefix(path);
        let children: Vec<String> = self
            .files
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();
        if children.is_empty() {
            return Ok(false);
        }
        if !recursive {
            return Err(anyhow!("directory `{path}` is not empty"));
        }
        for child in children {
            self.files.remove(&child);
        }
        Ok(true)
    }
}
