//! Sharded checkpointing for data-parallel jobs
//!
//! Every worker persists its own shard of model, optimizer and scheduler
//! state under a generation directory; rank 0 marks the generation complete
//! once all shards are durable. On restart the newest complete generation
//! is loaded and resharded to the current topology.
//!
//! ```text
//! CheckpointCoordinator
//!   ├── AsyncSavePipeline ── CheckpointWriter ── codec / manifest
//!   └── CheckpointReader ── reshard::FlatStateDict
//! ```

pub mod codec;
pub mod layout;
pub mod manager;
pub mod manifest;
pub mod pipeline;
pub mod reader;
pub mod reshard;
pub mod writer;

#[cfg(test)]
mod testing;

pub use layout::{CheckpointLayout, MARKER_FILE};
pub use manager::CheckpointCoordinator;
pub use manifest::{CheckpointManifest, ShardEntry};
pub use pipeline::{AsyncSavePipeline, SaveHandle, SaveOutcome, SubmitReceipt};
pub use reader::{CheckpointReader, GenerationEntry};
pub use reshard::{FlatKey, FlatStateDict};
pub use writer::{CheckpointWriter, NoopSnapshotHook, SnapshotHook};
