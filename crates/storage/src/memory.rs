//! In-memory storage backend
//!
//! Stands in for a remote tier in single-node runs and tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use runtime_core::{Error, Result};
use std::sync::Arc;

use crate::StorageBackend;

/// Blob store held in a concurrent map; clones share the same contents
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    blobs: Arc<DashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.blobs
            .get(path)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let size = data.len() as u64;
        self.blobs.insert(path.to_string(), data);
        Ok(size)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.blobs
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .blobs
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        Ok(paths)
    }
}
