//! Storage backend trait definition
//!
//! The checkpoint coordinator depends only on these operations, whether the
//! bytes end up on local disk, a network filesystem or a tiered remote store.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};

/// Async trait for storage backends
///
/// Paths are `/`-separated and relative to the backend's root.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Read the blob at `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there, `Storage` for
    /// transient failures
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write a blob, replacing nothing that a reader could observe half-written
    ///
    /// Backends make the write atomic where they can (temp file + rename on
    /// filesystems, single PUT on object stores).
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the blob at `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a blob exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all blob paths starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete every blob under `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for path in self.list(prefix).await? {
            match self.delete(&path).await {
                Ok(()) => removed += 1,
                Err(Error::StoragePathNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}
