//! Checkpoint discovery and resharding load
//!
//! Discovery walks generation directories newest first and picks the first
//! one carrying a completion marker. Directories without a marker are the
//! expected residue of a crash mid-save: they are skipped with a warning.
//! Anything wrong with a directory that *has* a marker is a
//! [`Error::CorruptRecord`] and is never skipped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use runtime_core::{
    Error, Generation, Rank, ReconstructedState, Result, StateBlob, TargetShard,
};
use storage::StorageBackend;
use tracing::{info, instrument, warn};

use crate::codec::decode_shard;
use crate::layout::{CheckpointLayout, MARKER_FILE};
use crate::manifest::CheckpointManifest;
use crate::reshard::{flatten, scheduler_source};

/// A generation directory found in storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationEntry {
    pub generation: Generation,
    /// Directory name as stored
    pub dir: String,
    /// Whether the completion marker is present
    pub complete: bool,
}

/// Reads checkpoint records for one model type
#[derive(Debug, Clone)]
pub struct CheckpointReader {
    storage: Arc<dyn StorageBackend>,
    layout: CheckpointLayout,
    rank: Rank,
}

impl CheckpointReader {
    pub fn new(storage: Arc<dyn StorageBackend>, layout: CheckpointLayout) -> Self {
        Self {
            storage,
            layout,
            rank: 0,
        }
    }

    /// Rank of the worker using this reader; only rank 0 logs progress
    pub fn for_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Every generation directory, newest first
    #[instrument(skip(self), fields(model_type = %self.layout.model_type()))]
    pub async fn list_generations(&self) -> Result<Vec<GenerationEntry>> {
        let paths = self.storage.list(&self.layout.listing_prefix()).await?;

        let mut found: BTreeMap<Generation, GenerationEntry> = BTreeMap::new();
        for path in &paths {
            let Some((generation, dir)) = self.layout.generation_of_path(path) else {
                continue;
            };
            let is_marker = path[dir.len()..].trim_start_matches('/') == MARKER_FILE;
            let entry = found.entry(generation).or_insert_with(|| GenerationEntry {
                generation,
                dir,
                complete: false,
            });
            entry.complete |= is_marker;
        }

        Ok(found.into_values().rev().collect())
    }

    /// Newest generation that has a completion marker
    pub async fn discover_latest(&self) -> Result<Option<Generation>> {
        for entry in self.list_generations().await? {
            if entry.complete {
                return Ok(Some(entry.generation));
            }
            warn!(
                path = %entry.dir,
                "Skipping checkpoint without {} marker", MARKER_FILE
            );
        }
        Ok(None)
    }

    /// Like [`discover_latest`](Self::discover_latest), but a missing
    /// checkpoint is an error
    pub async fn latest(&self) -> Result<Generation> {
        self.discover_latest().await?.ok_or(Error::NoCheckpointFound)
    }

    /// Read and validate the manifest of a complete generation
    pub async fn read_manifest(&self, generation: Generation) -> Result<CheckpointManifest> {
        let marker = self.layout.marker_path(generation);
        let data = match self.storage.read(&marker).await {
            Ok(data) => data,
            Err(Error::StoragePathNotFound { .. }) => {
                return Err(Error::IncompleteRecord {
                    generation,
                    reason: format!("no completion marker at {}", marker),
                })
            }
            Err(e) => return Err(e),
        };

        let manifest = CheckpointManifest::parse(generation, &data)?;
        if manifest.model_type != self.layout.model_type() {
            return Err(Error::corrupt(
                generation,
                format!(
                    "manifest is for model type {}, expected {}",
                    manifest.model_type,
                    self.layout.model_type()
                ),
            ));
        }
        Ok(manifest)
    }

    async fn read_blobs(
        &self,
        generation: Generation,
        manifest: &CheckpointManifest,
    ) -> Result<Vec<StateBlob>> {
        let mut blobs = Vec::with_capacity(manifest.shards.len());
        for entry in &manifest.shards {
            let data = match self.storage.read(&entry.path).await {
                Ok(data) => data,
                Err(Error::StoragePathNotFound { path }) => {
                    return Err(Error::corrupt(
                        generation,
                        format!("shard of rank {} missing at {}", entry.rank, path),
                    ))
                }
                Err(e) => return Err(e),
            };

            let (header, blob) = decode_shard(generation, &data)?;
            if header.rank != entry.rank || header.world_size != manifest.topology.world_size {
                return Err(Error::corrupt(
                    generation,
                    format!(
                        "{} holds rank {} of {}, manifest expects rank {} of {}",
                        entry.path,
                        header.rank,
                        header.world_size,
                        entry.rank,
                        manifest.topology.world_size
                    ),
                ));
            }
            if blob.progress_counters != manifest.progress {
                return Err(Error::corrupt(
                    generation,
                    format!("rank {} saved different progress counters", entry.rank),
                ));
            }
            blobs.push(blob);
        }
        Ok(blobs)
    }

    /// Rebuild `target`'s state from `generation`, resharding from the
    /// saved topology when it differs
    #[instrument(skip(self, target), fields(rank = target.rank, world_size = target.topology.world_size))]
    pub async fn load(&self, generation: Generation, target: &TargetShard) -> Result<ReconstructedState> {
        target.topology.check_rank(target.rank)?;
        let start = Instant::now();

        let manifest = self.read_manifest(generation).await?;
        let saved_topology = manifest.topology;
        let mut blobs = self.read_blobs(generation, &manifest).await?;

        let source = scheduler_source(saved_topology.world_size, target.rank);
        let scheduler_fragment = blobs
            .iter_mut()
            .find(|b| b.owner_shard_id == source)
            .map(|b| std::mem::take(&mut b.scheduler_fragment))
            .unwrap_or_default();

        let flat = flatten(generation, blobs)?;
        let model_fragment = flat.reshard_model(target)?;
        let optimizer_fragment = flat.reshard_optimizer(&model_fragment)?;

        if self.is_coordinator() {
            info!(
                path = %self.layout.dir_name(generation),
                saved_world_size = saved_topology.world_size,
                target_world_size = target.topology.world_size,
                tensors = flat.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Loaded model state"
            );
        }

        Ok(ReconstructedState {
            generation: Some(generation),
            model_fragment,
            optimizer_fragment,
            scheduler_fragment,
            total_steps: manifest.progress.total_steps,
            resume_cursor: manifest.progress.resume_cursor,
        })
    }

    /// Load the newest complete generation, or a fresh state if none exists
    pub async fn load_latest(&self, target: &TargetShard) -> Result<ReconstructedState> {
        match self.discover_latest().await? {
            Some(generation) => self.load(generation, target).await,
            None => {
                if self.is_coordinator() {
                    info!(
                        model_type = %self.layout.model_type(),
                        "No checkpoints found, starting from scratch"
                    );
                }
                Ok(ReconstructedState::fresh())
            }
        }
    }
}
