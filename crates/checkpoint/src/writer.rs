//! Collective checkpoint writer
//!
//! Every rank calls [`CheckpointWriter::save`] with the same generation. Each
//! rank writes its own shard file; rank 0 writes the completion marker only
//! after a barrier confirms every rank is done and it has seen every shard in
//! storage. A generation without a marker is never loaded, so a failure at
//! any point leaves at worst an orphaned directory.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use runtime_core::{Error, Generation, ProcessGroup, Result, ShardTopology, StateBlob};
use storage::StorageBackend;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::encode_shard;
use crate::layout::CheckpointLayout;
use crate::manifest::CheckpointManifest;

/// Work run on the caller's side right before state is snapshotted, e.g.
/// synchronising the accelerator and returning cached allocator blocks.
pub trait SnapshotHook: Send + Sync + fmt::Debug {
    fn release_device_memory(&self) -> Result<()>;
}

/// Hook that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSnapshotHook;

impl SnapshotHook for NoopSnapshotHook {
    fn release_device_memory(&self) -> Result<()> {
        Ok(())
    }
}

/// Writes one rank's shard and takes part in committing the generation
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    storage: Arc<dyn StorageBackend>,
    group: Arc<dyn ProcessGroup>,
    layout: CheckpointLayout,
    topology: ShardTopology,
    hook: Arc<dyn SnapshotHook>,
}

impl CheckpointWriter {
    /// Writer saving with a chunked topology over the whole group
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        group: Arc<dyn ProcessGroup>,
        layout: CheckpointLayout,
    ) -> Self {
        let topology = ShardTopology::chunked(group.world_size());
        Self {
            storage,
            group,
            layout,
            topology,
            hook: Arc::new(NoopSnapshotHook),
        }
    }

    /// Record `topology` as the one the saved shards follow
    pub fn with_topology(mut self, topology: ShardTopology) -> Result<Self> {
        if topology.world_size != self.group.world_size() {
            return Err(Error::InvalidConfig {
                message: format!(
                    "topology world size {} differs from process group size {}",
                    topology.world_size,
                    self.group.world_size()
                ),
            });
        }
        self.topology = topology;
        Ok(self)
    }

    pub fn set_snapshot_hook(&mut self, hook: Arc<dyn SnapshotHook>) {
        self.hook = hook;
    }

    pub fn layout(&self) -> &CheckpointLayout {
        &self.layout
    }

    pub fn topology(&self) -> ShardTopology {
        self.topology
    }

    pub fn group(&self) -> &Arc<dyn ProcessGroup> {
        &self.group
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Run the snapshot hook. A failing hook is logged and the save proceeds.
    pub fn prepare(&self) {
        if let Err(e) = self.hook.release_device_memory() {
            warn!(rank = self.group.rank(), error = %e, "Snapshot hook failed");
        }
    }

    /// Collectively save `blob` as `generation`
    pub async fn save(&self, generation: Generation, blob: StateBlob) -> Result<()> {
        self.prepare();
        self.persist(generation, blob).await
    }

    /// [`save`](Self::save) without the snapshot hook; used once the caller
    /// has already run [`prepare`](Self::prepare)
    #[instrument(skip(self, blob), fields(generation = generation.0, rank = self.group.rank()))]
    pub async fn persist(&self, generation: Generation, blob: StateBlob) -> Result<()> {
        let rank = self.group.rank();
        let start = Instant::now();

        if self.group.is_coordinator() {
            info!(
                path = %self.layout.dir_name(generation),
                world_size = self.topology.world_size,
                "Writing checkpoint"
            );
        }

        let written = self
            .write_shard(generation, &blob)
            .await
            .map_err(|e| match e {
                e @ (Error::InvalidConfig { .. } | Error::InvalidRank { .. }) => e,
                e => Error::SaveFailed {
                    generation,
                    message: format!("rank {} shard write failed: {}", rank, e),
                },
            });
        if let Err(e) = &written {
            error!(%generation, rank, error = %e, "Shard write failed");
        }

        // Reached unconditionally so peers never wait on a failed rank
        if let Err(e) = self
            .group
            .barrier(&format!("save/{}/shards", generation.0))
            .await
        {
            written?;
            return Err(e);
        }

        let committed = if self.group.is_coordinator() && written.is_ok() {
            let result = self.commit(generation, &blob).await;
            if let Err(e) = &result {
                error!(%generation, error = %e, "Failed to commit checkpoint");
            }
            Some(result)
        } else {
            None
        };

        if let Err(e) = self
            .group
            .barrier(&format!("save/{}/commit", generation.0))
            .await
        {
            written?;
            return Err(e);
        }

        let size = written?;
        if let Some(Err(e)) = committed {
            return Err(Error::SaveFailed {
                generation,
                message: format!("commit failed: {}", e),
            });
        }

        if !self
            .storage
            .exists(&self.layout.marker_path(generation))
            .await?
        {
            return Err(Error::SaveFailed {
                generation,
                message: "completion marker was not written".to_string(),
            });
        }

        if self.group.is_coordinator() {
            info!(
                path = %self.layout.dir_name(generation),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Completed checkpoint"
            );
        }
        debug!(%generation, rank, size_bytes = size, "Shard committed");
        Ok(())
    }

    /// Validate, encode and store this rank's shard.
    ///
    /// Unless the generation is already complete, any failure removes this
    /// rank's shard path so the commit check cannot pick up a file left by an
    /// earlier attempt at the same generation.
    async fn write_shard(&self, generation: Generation, blob: &StateBlob) -> Result<u64> {
        let rank = self.group.rank();
        self.topology.check_rank(rank)?;
        let path = self.layout.shard_path(generation, rank);

        let marker = self.layout.marker_path(generation);
        match self.storage.exists(&marker).await {
            Ok(false) => {}
            Ok(true) => {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "{} is already complete at {}, refusing to overwrite",
                        generation, marker
                    ),
                })
            }
            Err(e) => {
                self.discard_shard(&path).await;
                return Err(e);
            }
        }

        let written = self.encode_and_write(generation, blob, &path).await;
        if written.is_err() {
            self.discard_shard(&path).await;
        }
        written
    }

    async fn encode_and_write(
        &self,
        generation: Generation,
        blob: &StateBlob,
        path: &str,
    ) -> Result<u64> {
        if blob.owner_shard_id != self.group.rank() {
            return Err(Error::InvalidRank {
                rank: blob.owner_shard_id,
                world_size: self.topology.world_size,
            });
        }
        let encoded = encode_shard(generation, self.topology.world_size, blob)?;
        self.storage.write(path, encoded).await
    }

    /// Best-effort removal of this rank's shard after a failed write
    async fn discard_shard(&self, path: &str) {
        match self.storage.delete(path).await {
            Ok(()) | Err(Error::StoragePathNotFound { .. }) => {}
            Err(e) => warn!(path = %path, error = %e, "Failed to remove shard of failed save"),
        }
    }

    /// Rank 0: confirm every shard is present, then write the marker
    async fn commit(&self, generation: Generation, blob: &StateBlob) -> Result<()> {
        let manifest = CheckpointManifest::new(
            &self.layout,
            generation,
            self.topology,
            blob.progress_counters,
        );

        for entry in &manifest.shards {
            if !self.storage.exists(&entry.path).await? {
                return Err(Error::IncompleteRecord {
                    generation,
                    reason: format!("shard of rank {} missing at {}", entry.rank, entry.path),
                });
            }
        }

        let marker = self.layout.marker_path(generation);
        self.storage
            .write(&marker, manifest.to_bytes()?.into())
            .await?;
        debug!(path = %marker, "Completion marker written");
        Ok(())
    }
}
