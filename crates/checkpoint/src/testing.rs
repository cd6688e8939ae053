//! Fixtures shared by unit tests

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use runtime_core::{
    Error, GlobalState, GlobalTensor, ProgressCounters, Result, ShardTopology, StateBlob,
};
use storage::{MemoryStorage, StorageBackend};
use tokio::sync::Semaphore;

/// A small model with one parameter-shaped and one scalar optimizer state
pub fn sample_global() -> GlobalState {
    let mut global = GlobalState::default();
    global.model.insert(
        "layer.weight".to_string(),
        GlobalTensor::new(vec![4, 3], (0..12).map(|v| v as f32).collect()),
    );
    global.model.insert(
        "layer.bias".to_string(),
        GlobalTensor::new(vec![3], vec![0.5, 1.5, 2.5]),
    );

    let mut states = BTreeMap::new();
    states.insert(
        "exp_avg".to_string(),
        GlobalTensor::new(vec![4, 3], (0..12).map(|v| v as f32 * 0.1).collect()),
    );
    states.insert("step".to_string(), GlobalTensor::scalar(42.0));
    global.optimizer.insert("layer.weight".to_string(), states);

    global.scheduler = b"{\"last_epoch\":42}".to_vec();
    global.progress = ProgressCounters {
        total_steps: 42,
        resume_cursor: 168,
    };
    global
}

pub fn sample_blobs(world_size: usize) -> Vec<StateBlob> {
    let global = sample_global();
    let topology = ShardTopology::chunked(world_size);
    (0..world_size)
        .map(|rank| StateBlob::from_global(&global, &topology, rank).unwrap())
        .collect()
}

/// Memory storage whose writes, or reads and stats, fail for selected paths
#[derive(Debug)]
pub struct FailingStorage {
    inner: MemoryStorage,
    patterns: Mutex<Vec<String>>,
    read_patterns: Mutex<Vec<String>>,
}

impl FailingStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            patterns: Mutex::new(Vec::new()),
            read_patterns: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_paths_containing(&self, pattern: &str) {
        self.patterns.lock().push(pattern.to_string());
    }

    pub fn fail_reads_containing(&self, pattern: &str) {
        self.read_patterns.lock().push(pattern.to_string());
    }

    pub fn heal(&self) {
        self.patterns.lock().clear();
        self.read_patterns.lock().clear();
    }

    fn check_read(&self, path: &str) -> Result<()> {
        if self.read_patterns.lock().iter().any(|p| path.contains(p.as_str())) {
            return Err(Error::Storage {
                message: format!("injected failure reading {}", path),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FailingStorage {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.check_read(path)?;
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        if self.patterns.lock().iter().any(|p| path.contains(p.as_str())) {
            return Err(Error::Storage {
                message: format!("injected failure writing {}", path),
            });
        }
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_read(path)?;
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

/// Memory storage whose writes wait for a permit
#[derive(Debug)]
pub struct GatedStorage {
    inner: MemoryStorage,
    gate: Arc<Semaphore>,
}

impl GatedStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        Self {
            inner,
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(1024);
    }
}

#[async_trait]
impl StorageBackend for GatedStorage {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let _permit = self.gate.acquire().await.map_err(|_| Error::ChannelClosed {
            channel: "storage gate".to_string(),
        })?;
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}
