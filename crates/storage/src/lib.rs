//! Storage - Pluggable storage backends for sharded checkpoint records
//!
//! Provides async blob storage with:
//! - Local or shared filesystem with atomic writes (default feature)
//! - An in-memory store
//! - A tiered backend: local cache in front of a remote tier
//! - Amazon S3 / S3-compatible remote tier (with `s3` feature)
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/checkpoints");
//! storage.write("model-100steps/shard-00000.ckpt", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("model-100steps/shard-00000.ckpt").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
mod memory;
mod tiered;

#[cfg(feature = "s3")]
mod s3;

use std::sync::Arc;

use runtime_core::{BackendKind, CheckpointConfig, RemoteTier, Result};
use tracing::info;

pub use backend::StorageBackend;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use tiered::TieredStorage;

#[cfg(feature = "s3")]
pub use s3::{S3Settings, S3Storage};

/// Build the backend described by `config`, rooted at `config.base_path`
pub async fn open_backend(config: &CheckpointConfig) -> Result<Arc<dyn StorageBackend>> {
    let local = Arc::new(LocalStorage::new(&config.base_path));

    match &config.storage.backend {
        BackendKind::Local => {
            info!(base_path = ?config.base_path, "Using local storage backend");
            Ok(local)
        }
        BackendKind::Tiered {
            remote,
            save_to_remote,
        } => {
            let remote = open_remote(remote, config).await?;
            info!(
                base_path = ?config.base_path,
                save_to_remote,
                "Using tiered storage backend"
            );
            Ok(Arc::new(TieredStorage::new(local, remote, *save_to_remote)))
        }
    }
}

async fn open_remote(
    remote: &RemoteTier,
    #[allow(unused_variables)] config: &CheckpointConfig,
) -> Result<Arc<dyn StorageBackend>> {
    match remote {
        RemoteTier::Directory { path } => Ok(Arc::new(LocalStorage::new(path))),

        #[cfg(feature = "s3")]
        RemoteTier::S3 {
            bucket,
            prefix,
            region,
            endpoint,
        } => {
            let settings = S3Settings {
                bucket: bucket.clone(),
                prefix: prefix.clone(),
                region: region.clone(),
                endpoint: endpoint.clone(),
            };
            Ok(Arc::new(
                S3Storage::connect(settings, config.storage.retry.clone()).await,
            ))
        }

        #[cfg(not(feature = "s3"))]
        RemoteTier::S3 { .. } => Err(runtime_core::Error::StorageUnavailable {
            backend: "s3 (built without the `s3` feature)".to_string(),
        }),
    }
}
