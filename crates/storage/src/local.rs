//! Local filesystem storage backend
//!
//! Serves both node-local disks and shared network filesystems. Every write
//! goes to a hidden temp file first and is renamed into place, so a crash
//! mid-write never leaves a truncated shard or marker behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::StorageBackend;

/// Suffix of in-progress writes; such files are never listed
const TEMP_SUFFIX: &str = ".tmp";

/// Local filesystem storage backend
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Root directory for all storage operations
    base_path: PathBuf,
}

fn storage_error(context: impl std::fmt::Display, e: std::io::Error) -> Error {
    Error::Storage {
        message: format!("{}: {}", context, e),
    }
}

impl LocalStorage {
    /// Create a LocalStorage rooted at `base_path`
    ///
    /// The directory is created lazily on first write.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create a LocalStorage and make sure its root exists
    pub async fn create<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let storage = Self::new(base_path);
        fs::create_dir_all(&storage.base_path)
            .await
            .map_err(|e| storage_error(format!("create {:?}", storage.base_path), e))?;
        Ok(storage)
    }

    /// Get the root path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}{}",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4(),
            TEMP_SUFFIX
        );
        full_path.with_file_name(temp_name)
    }

    fn is_temp_file(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
    }

    /// Relative `/`-separated form of an absolute path under the root
    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    /// Make a completed rename durable by syncing the containing directory
    async fn sync_dir(dir: &Path) {
        #[cfg(unix)]
        {
            let synced = match fs::File::open(dir).await {
                Ok(handle) => handle.sync_all().await,
                Err(e) => Err(e),
            };
            if let Err(e) = synced {
                warn!(?dir, error = %e, "Failed to sync directory");
            }
        }
        #[cfg(not(unix))]
        let _ = dir;
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Reading file");

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(storage_error(format!("read {}", path), e)),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        let parent = full_path.parent().map(Path::to_path_buf);
        if let Some(parent) = &parent {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(format!("create directory {:?}", parent), e))?;
        }

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &full_path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(storage_error(format!("write {}", path), e));
        }

        if let Some(parent) = &parent {
            Self::sync_dir(parent).await;
        }

        debug!(?full_path, size, "File written");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(storage_error(format!("delete {}", path), e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_error(format!("stat {}", path), e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_path = self.resolve_path(prefix);

        // Walk from the deepest existing directory the prefix names
        let root = if prefix.is_empty() || prefix.ends_with('/') {
            search_path
        } else {
            match search_path.parent() {
                Some(parent) => parent.to_path_buf(),
                None => return Ok(Vec::new()),
            }
        };

        let mut results = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(storage_error(format!("list {:?}", dir), e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| storage_error(format!("list {:?}", dir), e))?
            {
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                let entry_path = entry.path();

                if file_type.is_dir() {
                    stack.push(entry_path);
                } else if file_type.is_file()
                    && !Self::is_temp_file(&entry.file_name().to_string_lossy())
                {
                    if let Some(relative) = self.relative(&entry_path) {
                        if relative.starts_with(prefix) {
                            results.push(relative);
                        }
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Listed files");
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let removed = self.list(prefix).await?.len();

        // A whole generation directory goes in one call
        let full_path = self.resolve_path(prefix.trim_end_matches('/'));
        match fs::metadata(&full_path).await {
            Ok(meta) if meta.is_dir() && prefix.ends_with('/') => {
                fs::remove_dir_all(&full_path)
                    .await
                    .map_err(|e| storage_error(format!("remove {:?}", full_path), e))?;
                Ok(removed)
            }
            _ => {
                for path in self.list(prefix).await? {
                    self.delete(&path).await?;
                }
                Ok(removed)
            }
        }
    }
}
