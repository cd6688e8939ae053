//! Multi-rank checkpoint scenarios over an in-process group


use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use checkpoint::{CheckpointCoordinator, CheckpointLayout, CheckpointReader};
use common::{blob_for, global_at, run_ranks, union_of, FlakyStorage};
use runtime_core::{
    BackendKind, CheckpointConfig, Error, Generation, ModelFragment, ProcessGroup, RemoteTier,
    ShardTopology, StorageConfig, TargetShard,
};
use storage::{LocalStorage, MemoryStorage, StorageBackend};
use tempfile::TempDir;

fn config_at(dir: &TempDir) -> CheckpointConfig {
    CheckpointConfig {
        base_path: dir.path().to_path_buf(),
        ..Default::default()
    }
}

async fn save_all(
    storage: Arc<dyn StorageBackend>,
    world_size: usize,
    step: u64,
) -> Result<Vec<runtime_core::Result<()>>> {
    run_ranks(world_size, move |group| {
        let storage = storage.clone();
        async move {
            let topology = ShardTopology::chunked(world_size);
            let rank = group.rank();
            let mut coordinator = CheckpointCoordinator::with_storage(
                CheckpointConfig::default(),
                Arc::new(group),
                storage,
            )?;
            Ok(coordinator
                .save(Generation(step), blob_for(step, topology, rank))
                .await)
        }
    })
    .await
}

async fn resume_all(
    storage: Arc<dyn StorageBackend>,
    topology: ShardTopology,
) -> Result<Vec<runtime_core::Result<runtime_core::ReconstructedState>>> {
    run_ranks(topology.world_size, move |group| {
        let storage = storage.clone();
        async move {
            let rank = group.rank();
            let mut coordinator = CheckpointCoordinator::with_storage(
                CheckpointConfig::default(),
                Arc::new(group),
                storage,
            )?;
            Ok(coordinator.resume(&TargetShard::new(topology, rank)).await)
        }
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alternating_failures_never_expose_incomplete_generation() -> Result<()> {
    let memory = MemoryStorage::new();
    let flaky = Arc::new(FlakyStorage::new(Arc::new(memory.clone())));
    let reader = CheckpointReader::new(Arc::new(memory.clone()), CheckpointLayout::new("model"));

    let mut latest_good = None;
    for (i, step) in [10u64, 20, 30, 40, 50, 60].into_iter().enumerate() {
        let fails = i % 2 == 1;
        if fails {
            flaky.fail_writes_containing(format!("model-{}steps/shard-00001", step));
        }

        let results = save_all(flaky.clone(), 2, step).await?;
        for result in &results {
            assert_eq!(result.is_err(), fails, "step {}: {:?}", step, result);
        }
        if !fails {
            latest_good = Some(Generation(step));
        }

        assert_eq!(reader.discover_latest().await?, latest_good);
        assert_eq!(reader.discover_latest().await?, latest_good);
        flaky.heal();
    }

    assert_eq!(latest_good, Some(Generation(50)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rank_failing_before_write_blocks_commit_of_stale_shard() -> Result<()> {
    let memory = MemoryStorage::new();
    // Left behind by an attempt that crashed after rank 1 wrote its shard
    memory
        .write("model-20steps/shard-00001.ckpt", Bytes::from("stale"))
        .await?;

    let flaky = Arc::new(FlakyStorage::new(Arc::new(memory.clone())));
    flaky.fail_reads_containing("model-20steps/.metadata");

    let shared: Arc<dyn StorageBackend> = Arc::new(memory.clone());
    let failing: Arc<dyn StorageBackend> = flaky.clone();
    let results = run_ranks(2, move |group| {
        let storage = if group.rank() == 1 {
            failing.clone()
        } else {
            shared.clone()
        };
        async move {
            let rank = group.rank();
            let mut coordinator = CheckpointCoordinator::with_storage(
                CheckpointConfig::default(),
                Arc::new(group),
                storage,
            )?;
            Ok(coordinator
                .save(Generation(20), blob_for(20, ShardTopology::chunked(2), rank))
                .await)
        }
    })
    .await?;

    for result in &results {
        assert!(matches!(result, Err(Error::SaveFailed { .. })), "{:?}", result);
    }
    assert!(!memory.exists("model-20steps/.metadata").await?);
    assert!(!memory.exists("model-20steps/shard-00001.ckpt").await?);

    // A clean retry of the same generation commits
    flaky.heal();
    for result in save_all(Arc::new(memory.clone()), 2, 20).await? {
        result?;
    }
    let reader = CheckpointReader::new(Arc::new(memory), CheckpointLayout::new("model"));
    assert_eq!(reader.discover_latest().await?, Some(Generation(20)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rank_failing_to_read_does_not_stall_peers() -> Result<()> {
    let memory = MemoryStorage::new();
    for result in save_all(Arc::new(memory.clone()), 2, 10).await? {
        result?;
    }

    let flaky = FlakyStorage::new(Arc::new(memory.clone()));
    flaky.fail_reads_containing("shard-00000");
    let shared: Arc<dyn StorageBackend> = Arc::new(memory);
    let failing: Arc<dyn StorageBackend> = Arc::new(flaky);

    let start = Instant::now();
    let results = run_ranks(2, move |group| {
        let storage = if group.rank() == 1 {
            failing.clone()
        } else {
            shared.clone()
        };
        async move {
            let rank = group.rank();
            let mut coordinator = CheckpointCoordinator::with_storage(
                CheckpointConfig::default(),
                Arc::new(group),
                storage,
            )?;
            Ok(coordinator
                .resume(&TargetShard::new(ShardTopology::chunked(2), rank))
                .await)
        }
    })
    .await?;
    assert!(start.elapsed() < Duration::from_secs(5));

    let mut results = results.into_iter();
    let healthy = results.next().unwrap()?;
    assert_eq!(healthy.generation, Some(Generation(10)));
    let failed = results.next().unwrap();
    assert!(matches!(failed, Err(Error::Storage { .. })), "{:?}", failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_trip_same_topology() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));

    for result in save_all(storage.clone(), 3, 30).await? {
        result?;
    }
    assert!(dir.path().join("model-30steps/.metadata").exists());

    let topology = ShardTopology::chunked(3);
    for (rank, state) in resume_all(storage, topology).await?.into_iter().enumerate() {
        let state = state?;
        let blob = blob_for(30, topology, rank);
        assert_eq!(state.generation, Some(Generation(30)));
        assert_eq!(state.model_fragment, blob.model_fragment);
        assert_eq!(state.optimizer_fragment, blob.optimizer_fragment);
        assert_eq!(state.scheduler_fragment, blob.scheduler_fragment);
        assert_eq!(state.total_steps, 30);
        assert_eq!(state.resume_cursor, 120);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reshard_four_ranks_to_two() -> Result<()> {
    let memory: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    for result in save_all(memory.clone(), 4, 12).await? {
        result?;
    }

    let states: Vec<_> = resume_all(memory, ShardTopology::chunked(2))
        .await?
        .into_iter()
        .collect::<runtime_core::Result<_>>()?;

    let global = global_at(12);
    let models: Vec<_> = states.iter().map(|s| s.model_fragment.clone()).collect();
    let union = union_of(&models);
    for (name, tensor) in &global.model {
        assert_eq!(&union[name], &tensor.values, "{}", name);
    }

    let exp_avgs: Vec<ModelFragment> = states
        .iter()
        .map(|s| {
            s.optimizer_fragment
                .iter()
                .map(|(p, states)| (p.clone(), states["exp_avg"].clone()))
                .collect()
        })
        .collect();
    let union = union_of(&exp_avgs);
    for (name, states) in &global.optimizer {
        assert_eq!(&union[name], &states["exp_avg"].values, "{}", name);
    }

    for state in &states {
        assert_eq!(state.total_steps, 12);
        assert_eq!(state.optimizer_fragment["head.bias"]["step"].values, vec![12.0]);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reshard_to_more_ranks_and_replicated() -> Result<()> {
    let memory: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    for result in save_all(memory.clone(), 2, 8).await? {
        result?;
    }

    let states = resume_all(memory.clone(), ShardTopology::chunked(3)).await?;
    let models: Vec<_> = states
        .into_iter()
        .map(|s| s.map(|s| s.model_fragment))
        .collect::<runtime_core::Result<_>>()?;
    assert_eq!(union_of(&models)["embed.weight"], global_at(8).model["embed.weight"].values);

    let states = resume_all(memory, ShardTopology::replicated(2)).await?;
    for state in states {
        let state = state?;
        assert_eq!(
            state.model_fragment["head.weight"].values,
            global_at(8).model["head.weight"].values
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shape_change_is_topology_mismatch() -> Result<()> {
    let memory: Arc<dyn StorageBackend> = Arc::new(MemoryStorage::new());
    for result in save_all(memory.clone(), 2, 4).await? {
        result?;
    }

    let reader = CheckpointReader::new(memory, CheckpointLayout::new("model"));
    let mut shapes: std::collections::BTreeMap<_, _> = global_at(4)
        .model
        .into_iter()
        .map(|(name, t)| (name, t.shape))
        .collect();
    shapes.insert("head.weight".to_string(), vec![3, 4, 1]);

    let target = TargetShard::new(ShardTopology::chunked(2), 0).with_expected_shapes(shapes);
    let result = reader.load_latest(&target).await;
    assert!(matches!(result, Err(Error::TopologyMismatch { .. })));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fresh_directory_resumes_from_zero() -> Result<()> {
    let dir = TempDir::new()?;
    let config = config_at(&dir);

    let states = run_ranks(2, move |group| {
        let config = config.clone();
        async move {
            let rank = group.rank();
            let mut coordinator = CheckpointCoordinator::new(config, Arc::new(group)).await?;
            Ok(coordinator
                .resume(&TargetShard::new(ShardTopology::chunked(2), rank))
                .await?)
        }
    })
    .await?;

    for state in states {
        assert!(state.is_fresh());
        assert_eq!((state.total_steps, state.resume_cursor), (0, 0));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_shard_fails_every_rank() -> Result<()> {
    let dir = TempDir::new()?;
    let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(dir.path()));
    for result in save_all(storage.clone(), 2, 10).await? {
        result?;
    }

    let path = dir.path().join("model-10steps/shard-00001.ckpt");
    let mut bytes = std::fs::read(&path)?;
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xff;
    std::fs::write(&path, bytes)?;

    for result in resume_all(storage, ShardTopology::chunked(2)).await? {
        let err = result.unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
        assert!(err.is_fatal());
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tiered_storage_recovers_from_remote() -> Result<()> {
    let local = TempDir::new()?;
    let remote = TempDir::new()?;
    let config = CheckpointConfig {
        base_path: local.path().to_path_buf(),
        storage: StorageConfig {
            backend: BackendKind::Tiered {
                remote: RemoteTier::Directory {
                    path: remote.path().to_path_buf(),
                },
                save_to_remote: true,
            },
            ..Default::default()
        },
        ..Default::default()
    };

    let save_config = config.clone();
    run_ranks(2, move |group| {
        let config = save_config.clone();
        async move {
            let rank = group.rank();
            let mut coordinator = CheckpointCoordinator::new(config, Arc::new(group)).await?;
            coordinator
                .save(Generation(7), blob_for(7, ShardTopology::chunked(2), rank))
                .await?;
            Ok(())
        }
    })
    .await?;
    assert!(remote.path().join("model-7steps/.metadata").exists());

    // Replacement node: empty local cache
    std::fs::remove_dir_all(local.path().join("model-7steps"))?;

    let states = run_ranks(2, move |group| {
        let config = config.clone();
        async move {
            let rank = group.rank();
            let mut coordinator = CheckpointCoordinator::new(config, Arc::new(group)).await?;
            Ok(coordinator
                .resume(&TargetShard::new(ShardTopology::chunked(2), rank))
                .await?)
        }
    })
    .await?;

    for (rank, state) in states.into_iter().enumerate() {
        assert_eq!(state.generation, Some(Generation(7)));
        assert_eq!(
            state.model_fragment,
            blob_for(7, ShardTopology::chunked(2), rank).model_fragment
        );
    }
    assert!(local.path().join("model-7steps/shard-00001.ckpt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prune_runs_on_rank_zero_only() -> Result<()> {
    let memory = MemoryStorage::new();
    let storage: Arc<dyn StorageBackend> = Arc::new(memory.clone());
    for step in [5, 10, 15] {
        for result in save_all(storage.clone(), 2, step).await? {
            result?;
        }
    }
    memory
        .write("model-20steps/shard-00000.ckpt", Bytes::from("in flight"))
        .await?;

    let removed = run_ranks(2, move |group| {
        let storage = storage.clone();
        async move {
            let coordinator = CheckpointCoordinator::with_storage(
                CheckpointConfig::default(),
                Arc::new(group),
                storage,
            )?;
            Ok(coordinator.prune(1).await?)
        }
    })
    .await?;

    assert_eq!(removed[0], vec![Generation(10), Generation(5)]);
    assert!(removed[1].is_empty());
    assert!(memory.exists("model-20steps/shard-00000.ckpt").await?);
    assert!(!memory.exists("model-5steps/.metadata").await?);
    assert!(memory.exists("model-15steps/.metadata").await?);
    Ok(())
}
