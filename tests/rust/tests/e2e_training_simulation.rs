//! End-to-end training simulation
//!
//! Workers run a fake training loop, checkpointing asynchronously every few
//! steps. The job crashes while one save is in flight, then restarts with a
//! different number of workers and continues from the last complete
//! checkpoint.


use std::sync::Arc;

use anyhow::Result;
use checkpoint::{CheckpointCoordinator, SnapshotHook};
use common::{blob_for, global_at, run_ranks, union_of, FlakyStorage};
use runtime_core::{
    CheckpointConfig, Generation, LocalProcessGroup, ProcessGroup, ReconstructedState,
    ShardTopology, StateBlob, TargetShard,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;

const SAVE_EVERY: u64 = 4;

#[derive(Debug, Default)]
struct CountingHook(AtomicUsize);

impl SnapshotHook for CountingHook {
    fn release_device_memory(&self) -> runtime_core::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Simulates one training worker
struct SimulatedWorker {
    rank: usize,
    topology: ShardTopology,
    coordinator: CheckpointCoordinator,
    step: u64,
}

impl SimulatedWorker {
    fn new(
        group: LocalProcessGroup,
        storage: Arc<dyn StorageBackend>,
        hook: Arc<CountingHook>,
    ) -> Result<Self> {
        let rank = group.rank();
        let topology = ShardTopology::chunked(group.world_size());
        let coordinator =
            CheckpointCoordinator::with_storage(CheckpointConfig::default(), Arc::new(group), storage)?
                .with_snapshot_hook(hook);
        Ok(Self {
            rank,
            topology,
            coordinator,
            step: 0,
        })
    }

    async fn resume(&mut self) -> Result<ReconstructedState> {
        let state = self
            .coordinator
            .resume(&TargetShard::new(self.topology, self.rank))
            .await?;
        self.step = state.total_steps;
        Ok(state)
    }

    fn local_state(&self) -> StateBlob {
        blob_for(self.step, self.topology, self.rank)
    }

    /// Train until `until`, submitting a background save every `SAVE_EVERY` steps.
    /// Returns the generations whose previous-save outcome was a failure.
    async fn train(&mut self, until: u64) -> Result<Vec<Generation>> {
        let mut failed = Vec::new();
        while self.step < until {
            self.step += 1;
            if self.step % SAVE_EVERY == 0 {
                let receipt = self
                    .coordinator
                    .submit(Generation(self.step), self.local_state())
                    .await?;
                if let Some(previous) = receipt.previous {
                    if !previous.is_success() {
                        failed.push(previous.generation);
                    }
                }
            }
        }
        Ok(failed)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crash_and_elastic_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let flaky = Arc::new(FlakyStorage::new(Arc::new(LocalStorage::new(dir.path()))));
    let hook = Arc::new(CountingHook::default());

    // The marker of generation 12 never lands: the job dies mid-save
    flaky.fail_writes_containing("model-12steps/.metadata");

    let storage: Arc<dyn StorageBackend> = flaky.clone();
    let first_run = {
        let storage = storage.clone();
        let hook = hook.clone();
        run_ranks(2, move |group| {
            let storage = storage.clone();
            let hook = hook.clone();
            async move {
                let mut worker = SimulatedWorker::new(group, storage, hook)?;
                assert!(worker.resume().await?.is_fresh());
                let failed = worker.train(12).await?;
                let flushed = worker.coordinator.flush().await;
                Ok((failed, flushed.is_err()))
            }
        })
        .await?
    };
    for (failed, flush_failed) in first_run {
        assert!(failed.is_empty());
        assert!(flush_failed);
    }
    assert_eq!(hook.0.load(Ordering::SeqCst), 2 * 3);
    assert!(dir.path().join("model-8steps/.metadata").exists());
    assert!(!dir.path().join("model-12steps/.metadata").exists());

    flaky.heal();

    // Restart with three workers
    let second_run = {
        let storage = storage.clone();
        let hook = hook.clone();
        run_ranks(3, move |group| {
            let storage = storage.clone();
            let hook = hook.clone();
            async move {
                let mut worker = SimulatedWorker::new(group, storage, hook)?;
                let state = worker.resume().await?;
                let resumed = (state.generation, state.total_steps, state.resume_cursor);
                let model = state.model_fragment;

                worker.train(20).await?;
                worker.coordinator.flush().await?;
                let pruned = worker.coordinator.prune(2).await?;
                Ok((resumed, model, pruned))
            }
        })
        .await?
    };

    let models: Vec<_> = second_run.iter().map(|(_, model, _)| model.clone()).collect();
    let union = union_of(&models);
    for (name, tensor) in global_at(8).model {
        assert_eq!(union[&name], tensor.values, "{}", name);
    }
    for ((generation, total_steps, resume_cursor), _, _) in &second_run {
        assert_eq!(*generation, Some(Generation(8)));
        assert_eq!((*total_steps, *resume_cursor), (8, 32));
    }

    // Completed: 4, 8, 12 (re-saved), 16, 20. Keep the newest two.
    let mut pruned = second_run[0].2.clone();
    pruned.sort();
    assert_eq!(pruned, vec![Generation(4), Generation(8), Generation(12)]);
    assert!(second_run[1].2.is_empty());
    assert!(dir.path().join("model-20steps/.metadata").exists());
    assert!(dir.path().join("model-16steps/shard-00002.ckpt").exists());
    assert!(!dir.path().join("model-4steps").exists());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_save_reported_at_next_submit() -> Result<()> {
    let dir = TempDir::new()?;
    let flaky = Arc::new(FlakyStorage::new(Arc::new(LocalStorage::new(dir.path()))));
    flaky.fail_writes_containing("model-4steps/shard-00000");
    let storage: Arc<dyn StorageBackend> = flaky;

    let results = run_ranks(2, move |group| {
        let storage = storage.clone();
        async move {
            let mut worker =
                SimulatedWorker::new(group, storage, Arc::new(CountingHook::default()))?;
            let failed = worker.train(8).await?;
            worker.coordinator.flush().await?;
            Ok(failed)
        }
    })
    .await?;

    for failed in results {
        assert_eq!(failed, vec![Generation(4)]);
    }
    assert!(dir.path().join("model-8steps/.metadata").exists());
    assert!(!dir.path().join("model-4steps/.metadata").exists());
    Ok(())
}
