//! Checkpoint configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory (or key prefix) holding one subdirectory per generation
    pub base_path: PathBuf,

    /// Prefix of generation directory names: `<model_type>-<generation>steps`
    pub model_type: String,

    /// Storage settings
    pub storage: StorageConfig,

    /// How long a rank waits at a collective barrier
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,

    /// Completed generations kept by `prune`; `None` keeps all of them
    pub keep_last: Option<usize>,

    /// Flush device work and release memory pools before snapshotting
    pub release_device_memory: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./checkpoints"),
            model_type: "model".to_string(),
            storage: StorageConfig::default(),
            barrier_timeout: Duration::from_secs(600),
            keep_last: None,
            release_device_memory: true,
        }
    }
}

impl CheckpointConfig {
    /// Load configuration from a JSON file, filling unset fields with defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the coordinator cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.model_type.is_empty() {
            return Err(Error::InvalidConfig {
                message: "model_type must not be empty".to_string(),
            });
        }
        if self.model_type.contains('/') {
            return Err(Error::InvalidConfig {
                message: format!("model_type {:?} must not contain '/'", self.model_type),
            });
        }
        if self.barrier_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                message: "barrier_timeout must be positive".to_string(),
            });
        }
        if self.keep_last == Some(0) {
            return Err(Error::InvalidConfig {
                message: "keep_last must keep at least one checkpoint".to_string(),
            });
        }
        if let BackendKind::Tiered {
            remote: RemoteTier::S3 { bucket, .. },
            ..
        } = &self.storage.backend
        {
            if bucket.is_empty() {
                return Err(Error::InvalidConfig {
                    message: "S3 remote tier requires a bucket".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type
    pub backend: BackendKind,

    /// Retry configuration for remote operations
    pub retry: RetryConfig,
}

/// Storage backend type
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum BackendKind {
    /// Local or shared filesystem under `base_path`
    #[default]
    Local,

    /// Local cache under `base_path` in front of a remote tier
    Tiered {
        remote: RemoteTier,
        /// Write through to the remote tier on save
        save_to_remote: bool,
    },
}

/// Remote tier behind a tiered backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RemoteTier {
    /// S3-compatible object storage
    S3 {
        bucket: String,
        prefix: Option<String>,
        region: Option<String>,
        endpoint: Option<String>,
    },

    /// Another filesystem location, e.g. a network mount
    Directory { path: PathBuf },
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
