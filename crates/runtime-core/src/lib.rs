//! Runtime Core - Foundation for the sharded checkpoint coordinator
//!
//! Provides the shared data model, error taxonomy, configuration and the
//! process-group boundary used by the storage and checkpoint crates.

pub mod config;
pub mod error;
pub mod process_group;
pub mod telemetry;
pub mod types;

pub use config::{BackendKind, CheckpointConfig, RemoteTier, RetryConfig, StorageConfig};
pub use error::{Error, Result};
pub use process_group::{LocalProcessGroup, ProcessGroup, SingleProcessGroup};
pub use types::*;
