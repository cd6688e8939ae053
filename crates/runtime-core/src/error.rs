//! Error types for the sharded checkpoint coordinator

use thiserror::Error;

use crate::types::Generation;

/// Result type alias using the checkpoint Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for checkpoint save, discovery and load
#[derive(Error, Debug)]
pub enum Error {
    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage backend not available: {backend}")]
    StorageUnavailable { backend: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Checkpoint record errors
    #[error("No checkpoint found")]
    NoCheckpointFound,

    #[error("Checkpoint {generation} is incomplete: {reason}")]
    IncompleteRecord { generation: Generation, reason: String },

    #[error("Checkpoint {generation} is corrupt: {reason}")]
    CorruptRecord { generation: Generation, reason: String },

    #[error("Topology mismatch for {key}: {reason}")]
    TopologyMismatch { key: String, reason: String },

    #[error("Checkpoint save failed for {generation}: {message}")]
    SaveFailed { generation: Generation, message: String },

    // Coordination errors
    #[error("Barrier timeout: {barrier_id} (waited {timeout_ms}ms)")]
    BarrierTimeout { barrier_id: String, timeout_ms: u64 },

    #[error("Invalid rank {rank} for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl Error {
    /// Returns true if this error is retryable at the storage layer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::StorageUnavailable { .. } | Error::BarrierTimeout { .. }
        )
    }

    /// Returns true if this error requires operator intervention
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CorruptRecord { .. }
                | Error::TopologyMismatch { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Returns a retry delay hint in milliseconds, if applicable
    pub fn retry_delay_hint_ms(&self) -> Option<u64> {
        match self {
            Error::Storage { .. } => Some(100),
            Error::StorageUnavailable { .. } => Some(5000),
            Error::BarrierTimeout { .. } => Some(500),
            _ => None,
        }
    }

    /// Shorthand for a corrupt-record error
    pub fn corrupt(generation: Generation, reason: impl Into<String>) -> Self {
        Error::CorruptRecord {
            generation,
            reason: reason.into(),
        }
    }

    /// Shorthand for a topology mismatch
    pub fn mismatch(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::TopologyMismatch {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
