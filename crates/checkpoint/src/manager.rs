//! Per-worker entry point tying writer, reader, pipeline and retention
//! together over one storage backend and process group

use std::sync::Arc;

use runtime_core::{
    CheckpointConfig, Error, Generation, ProcessGroup, ReconstructedState, Result, StateBlob,
    TargetShard,
};
use storage::StorageBackend;
use tracing::{debug, error, info, warn};

use crate::layout::CheckpointLayout;
use crate::pipeline::{AsyncSavePipeline, SaveOutcome, SubmitReceipt};
use crate::reader::{CheckpointReader, GenerationEntry};
use crate::writer::{CheckpointWriter, SnapshotHook};

/// Checkpoint coordination for one worker of a process group
#[derive(Debug)]
pub struct CheckpointCoordinator {
    config: CheckpointConfig,
    group: Arc<dyn ProcessGroup>,
    storage: Arc<dyn StorageBackend>,
    reader: CheckpointReader,
    pipeline: AsyncSavePipeline,
}

impl CheckpointCoordinator {
    /// Open the backend `config` describes
    pub async fn new(config: CheckpointConfig, group: Arc<dyn ProcessGroup>) -> Result<Self> {
        config.validate()?;
        let storage = storage::open_backend(&config).await?;
        Self::with_storage(config, group, storage)
    }

    /// Use an already opened backend
    pub fn with_storage(
        config: CheckpointConfig,
        group: Arc<dyn ProcessGroup>,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = CheckpointLayout::new(config.model_type.clone());

        let writer = CheckpointWriter::new(storage.clone(), group.clone(), layout.clone());
        let reader = CheckpointReader::new(storage.clone(), layout).for_rank(group.rank());

        if group.is_coordinator() {
            info!(
                model_type = %config.model_type,
                world_size = group.world_size(),
                base_path = ?config.base_path,
                "Checkpoint coordinator ready"
            );
        }

        Ok(Self {
            config,
            group,
            storage,
            reader,
            pipeline: AsyncSavePipeline::new(writer),
        })
    }

    /// Install the pre-snapshot hook; ignored when `release_device_memory` is off
    pub fn with_snapshot_hook(mut self, hook: Arc<dyn SnapshotHook>) -> Self {
        if self.config.release_device_memory {
            self.pipeline.writer_mut().set_snapshot_hook(hook);
        } else {
            debug!("release_device_memory is disabled, snapshot hook not installed");
        }
        self
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn reader(&self) -> &CheckpointReader {
        &self.reader
    }

    pub fn in_flight(&self) -> Option<Generation> {
        self.pipeline.in_flight()
    }

    fn report(outcome: &SaveOutcome) {
        if let Err(e) = &outcome.result {
            error!(generation = %outcome.generation, error = %e, "Previous checkpoint save failed");
        }
    }

    /// Save `blob` and wait until the generation is committed on every rank
    pub async fn save(&mut self, generation: Generation, blob: StateBlob) -> Result<()> {
        if let Some(outcome) = self.pipeline.poll_previous().await {
            Self::report(&outcome);
        }

        let result = self.pipeline.writer().save(generation, blob).await;
        let barrier = self
            .group
            .barrier(&format!("save/{}/done", generation.0))
            .await;
        result?;
        barrier
    }

    /// Start saving `blob` in the background once the previous save resolved
    pub async fn submit(&mut self, generation: Generation, blob: StateBlob) -> Result<SubmitReceipt> {
        let receipt = self.pipeline.submit(generation, blob).await;
        self.group
            .barrier(&format!("submit/{}", generation.0))
            .await?;
        Ok(receipt)
    }

    pub async fn poll_previous(&mut self) -> Option<SaveOutcome> {
        self.pipeline.poll_previous().await
    }

    pub async fn try_poll_previous(&mut self) -> Option<SaveOutcome> {
        self.pipeline.try_poll_previous().await
    }

    /// Wait for the in-flight save; call before shutting down
    pub async fn flush(&mut self) -> Result<()> {
        self.pipeline.flush().await
    }

    /// Load the newest complete generation for `target`, or a fresh state
    pub async fn resume(&mut self, target: &TargetShard) -> Result<ReconstructedState> {
        if let Some(outcome) = self.pipeline.poll_previous().await {
            Self::report(&outcome);
        }

        let loaded = self.reader.load_latest(target).await;
        // Same id on every rank whatever its load outcome
        let barrier = self.group.barrier("load").await;
        let state = loaded?;
        barrier?;
        Ok(state)
    }

    /// Prune down to `config.keep_last` completed generations, if set
    pub async fn apply_retention(&self) -> Result<Vec<Generation>> {
        match self.config.keep_last {
            Some(keep) => self.prune(keep).await,
            None => Ok(Vec::new()),
        }
    }

    /// Delete completed generations beyond the newest `keep`, plus incomplete
    /// generations older than the newest completed one. Runs on rank 0 only;
    /// other ranks return an empty list.
    pub async fn prune(&self, keep: usize) -> Result<Vec<Generation>> {
        if keep == 0 {
            return Err(Error::InvalidConfig {
                message: "prune must keep at least one checkpoint".to_string(),
            });
        }
        if !self.group.is_coordinator() {
            return Ok(Vec::new());
        }

        let entries = self.reader.list_generations().await?;
        let Some(newest_complete) = entries.iter().find(|e| e.complete).map(|e| e.generation)
        else {
            debug!("No completed checkpoints, nothing to prune");
            return Ok(Vec::new());
        };

        let mut kept = 0;
        let mut doomed: Vec<&GenerationEntry> = Vec::new();
        for entry in &entries {
            if entry.complete {
                kept += 1;
                if kept > keep {
                    doomed.push(entry);
                }
            } else if entry.generation < newest_complete {
                doomed.push(entry);
            }
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for entry in doomed {
            // Marker first, so an interrupted prune never leaves a loadable partial record
            if entry.complete {
                let marker = format!("{}/{}", entry.dir, crate::layout::MARKER_FILE);
                match self.storage.delete(&marker).await {
                    Ok(()) | Err(Error::StoragePathNotFound { .. }) => {}
                    Err(e) => {
                        warn!(path = %entry.dir, error = %e, "Failed to prune checkpoint");
                        continue;
                    }
                }
            }

            match self.storage.delete_prefix(&format!("{}/", entry.dir)).await {
                Ok(files) => {
                    info!(path = %entry.dir, files, complete = entry.complete, "Pruned checkpoint");
                    removed.push(entry.generation);
                }
                Err(e) => warn!(path = %entry.dir, error = %e, "Failed to prune checkpoint"),
            }
        }
        Ok(removed)
    }
}
