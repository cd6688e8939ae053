//! Completion marker contents
//!
//! The `.metadata` file doubles as the record's manifest: its presence makes
//! a generation loadable, and its body says which topology wrote it and
//! where each rank's shard lives.

use chrono::{DateTime, Utc};
use runtime_core::{Error, Generation, ProgressCounters, Rank, Result, ShardTopology};
use serde::{Deserialize, Serialize};

use crate::layout::CheckpointLayout;

/// Manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// One rank's entry in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub rank: Rank,
    /// Path relative to the storage root
    pub path: String,
}

/// Body of the completion marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub model_type: String,
    pub generation: Generation,
    /// Topology the record was saved with
    pub topology: ShardTopology,
    pub shards: Vec<ShardEntry>,
    pub progress: ProgressCounters,
    pub created_at: DateTime<Utc>,
}

impl CheckpointManifest {
    /// Manifest for a record in which every rank of `topology` wrote a shard
    pub fn new(
        layout: &CheckpointLayout,
        generation: Generation,
        topology: ShardTopology,
        progress: ProgressCounters,
    ) -> Self {
        let shards = (0..topology.world_size)
            .map(|rank| ShardEntry {
                rank,
                path: layout.shard_path(generation, rank),
            })
            .collect();

        Self {
            format_version: MANIFEST_VERSION,
            model_type: layout.model_type().to_string(),
            generation,
            topology,
            shards,
            progress,
            created_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and sanity-check a marker found under `generation`'s directory
    pub fn parse(generation: Generation, data: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(data)
            .map_err(|e| Error::corrupt(generation, format!("unreadable manifest: {}", e)))?;
        manifest.validate(generation)?;
        Ok(manifest)
    }

    fn validate(&self, generation: Generation) -> Result<()> {
        if self.generation != generation {
            return Err(Error::corrupt(
                generation,
                format!("manifest names {}", self.generation),
            ));
        }
        if self.topology.world_size == 0 {
            return Err(Error::corrupt(generation, "manifest has zero world size"));
        }
        let mut ranks: Vec<_> = self.shards.iter().map(|s| s.rank).collect();
        ranks.sort_unstable();
        if ranks != (0..self.topology.world_size).collect::<Vec<_>>() {
            return Err(Error::corrupt(
                generation,
                format!(
                    "manifest lists ranks {:?} for world size {}",
                    ranks, self.topology.world_size
                ),
            ));
        }
        Ok(())
    }
}
