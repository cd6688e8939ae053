//! Tiered storage: a fast local tier in front of a durable remote tier
//!
//! Reads prefer the local tier and fall back to the remote one, pulling the
//! blob back into the local cache. Writes always land locally and, when
//! `save_to_remote` is set, are pushed through to the remote tier before the
//! write call returns.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tracing::{debug, instrument, warn};

use crate::StorageBackend;

/// Local cache plus remote fallback
#[derive(Debug, Clone)]
pub struct TieredStorage {
    local: Arc<dyn StorageBackend>,
    remote: Arc<dyn StorageBackend>,
    save_to_remote: bool,
}

impl TieredStorage {
    pub fn new(
        local: Arc<dyn StorageBackend>,
        remote: Arc<dyn StorageBackend>,
        save_to_remote: bool,
    ) -> Self {
        Self {
            local,
            remote,
            save_to_remote,
        }
    }

    pub fn local(&self) -> &Arc<dyn StorageBackend> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn StorageBackend> {
        &self.remote
    }

    pub fn saves_to_remote(&self) -> bool {
        self.save_to_remote
    }
}

/// Treat "not there" as success when deleting from a tier
fn ignore_missing(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(Error::StoragePathNotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl StorageBackend for TieredStorage {
    #[instrument(skip(self), fields(backend = "tiered"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        match self.local.read(path).await {
            Ok(data) => return Ok(data),
            Err(Error::StoragePathNotFound { .. }) => {}
            Err(e) => warn!(path, error = %e, "Local tier read failed, falling back to remote"),
        }

        let data = self.remote.read(path).await?;
        debug!(path, size = data.len(), "Read from remote tier");

        if let Err(e) = self.local.write(path, data.clone()).await {
            warn!(path, error = %e, "Failed to populate local cache");
        }
        Ok(data)
    }

    #[instrument(skip(self, data), fields(backend = "tiered", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let size = self.local.write(path, data.clone()).await?;
        if self.save_to_remote {
            self.remote.write(path, data).await?;
        }
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "tiered"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let local = ignore_missing(self.local.delete(path).await)?;
        let remote = ignore_missing(self.remote.delete(path).await)?;
        if local || remote {
            Ok(())
        } else {
            Err(Error::StoragePathNotFound {
                path: path.to_string(),
            })
        }
    }

    #[instrument(skip(self), fields(backend = "tiered"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        if self.local.exists(path).await? {
            return Ok(true);
        }
        self.remote.exists(path).await
    }

    #[instrument(skip(self), fields(backend = "tiered"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths = self.local.list(prefix).await?;
        match self.remote.list(prefix).await {
            Ok(remote) => paths.extend(remote),
            Err(e) => warn!(prefix, error = %e, "Remote tier list failed, using local tier only"),
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    #[instrument(skip(self), fields(backend = "tiered"))]
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let local = self.local.delete_prefix(prefix).await?;
        let remote = self.remote.delete_prefix(prefix).await?;
        Ok(local.max(remote))
    }
}
