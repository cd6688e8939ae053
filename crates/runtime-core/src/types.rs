//! Core type definitions for sharded checkpoint state

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use crate::{Error, Result};

/// Rank of a worker in its process group
pub type Rank = usize;

/// Parameter name, e.g. `layers.0.attn.q_proj.weight`
pub type ParamName = String;

/// Identifier for one checkpoint attempt, ordered by recency.
///
/// In the on-disk layout this is the step count embedded in the
/// `<model_type>-<generation>steps` directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "generation {}", self.0)
    }
}

impl From<u64> for Generation {
    fn from(step: u64) -> Self {
        Generation(step)
    }
}

/// How a parameter's flat element range is split across ranks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShardLayout {
    /// Flat even split: each rank owns `ceil(numel / world_size)` elements,
    /// the trailing ranks possibly fewer or none
    Chunked,

    /// Every rank holds the full parameter
    Replicated,
}

/// Mapping from global state to the workers of a process group
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardTopology {
    /// Number of workers
    pub world_size: usize,

    /// Ownership rule applied to every parameter
    pub layout: ShardLayout,
}

impl ShardTopology {
    /// Create a chunked topology
    pub fn chunked(world_size: usize) -> Self {
        Self {
            world_size,
            layout: ShardLayout::Chunked,
        }
    }

    /// Create a replicated topology
    pub fn replicated(world_size: usize) -> Self {
        Self {
            world_size,
            layout: ShardLayout::Replicated,
        }
    }

    /// Check that `rank` belongs to this topology
    pub fn check_rank(&self, rank: Rank) -> Result<()> {
        if self.world_size == 0 || rank >= self.world_size {
            return Err(Error::InvalidRank {
                rank,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    /// Flat element range of a `numel`-element parameter owned by `rank`
    pub fn owned_range(&self, rank: Rank, numel: usize) -> Range<usize> {
        match self.layout {
            ShardLayout::Replicated => 0..numel,
            ShardLayout::Chunked => {
                let world = self.world_size.max(1);
                let chunk = numel.div_ceil(world);
                let start = (rank * chunk).min(numel);
                let end = (start + chunk).min(numel);
                start..end
            }
        }
    }
}

/// One rank's slice of a flattened tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorShard {
    /// Shape of the full, unsharded tensor (empty for scalars)
    pub global_shape: Vec<usize>,

    /// Offset of `values[0]` in the flattened global tensor
    pub offset: usize,

    /// Owned elements
    pub values: Vec<f32>,
}

impl TensorShard {
    /// Number of elements in the global tensor
    pub fn global_numel(&self) -> usize {
        self.global_shape.iter().product()
    }

    /// Flat range covered by this shard
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.values.len()
    }

    /// A shard holding the whole tensor
    pub fn full(global_shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            global_shape,
            offset: 0,
            values,
        }
    }
}

/// Model parameters owned by one rank
pub type ModelFragment = BTreeMap<ParamName, TensorShard>;

/// Optimizer state keyed by parameter, then by state name (`exp_avg`, `step`, ...)
pub type OptimizerFragment = BTreeMap<ParamName, BTreeMap<String, TensorShard>>;

/// Process-wide progress, replicated identically by every rank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    /// Optimizer steps taken so far
    pub total_steps: u64,

    /// Batch index to resume the data stream from
    pub resume_cursor: u64,
}

/// The state one worker persists for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBlob {
    /// Rank that owns this shard
    pub owner_shard_id: Rank,

    /// Owned parameter slices
    pub model_fragment: ModelFragment,

    /// Optimizer state aligned with `model_fragment`
    pub optimizer_fragment: OptimizerFragment,

    /// Opaque learning-rate scheduler state
    pub scheduler_fragment: Vec<u8>,

    /// Replicated progress counters
    pub progress_counters: ProgressCounters,
}

/// A full unsharded tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl GlobalTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            values: vec![value],
        }
    }

    fn slice_for(&self, key: &str, range: Range<usize>) -> Result<TensorShard> {
        let numel: usize = self.shape.iter().product();
        if numel != self.values.len() {
            return Err(Error::mismatch(
                key,
                format!("shape {:?} holds {} values, got {}", self.shape, numel, self.values.len()),
            ));
        }
        Ok(TensorShard {
            global_shape: self.shape.clone(),
            offset: range.start,
            values: self.values[range].to_vec(),
        })
    }
}

/// Unsharded view of the whole computation's state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub model: BTreeMap<ParamName, GlobalTensor>,
    pub optimizer: BTreeMap<ParamName, BTreeMap<String, GlobalTensor>>,
    pub scheduler: Vec<u8>,
    pub progress: ProgressCounters,
}

impl StateBlob {
    /// Slice the portion of `global` that `rank` owns under `topology`.
    ///
    /// Optimizer states shaped like their parameter follow the parameter's
    /// range; scalar states are copied whole to every rank.
    pub fn from_global(global: &GlobalState, topology: &ShardTopology, rank: Rank) -> Result<Self> {
        topology.check_rank(rank)?;

        let mut model_fragment = ModelFragment::new();
        for (name, tensor) in &global.model {
            let range = topology.owned_range(rank, tensor.values.len());
            model_fragment.insert(name.clone(), tensor.slice_for(name, range)?);
        }

        let mut optimizer_fragment = OptimizerFragment::new();
        for (name, states) in &global.optimizer {
            let param = global
                .model
                .get(name)
                .ok_or_else(|| Error::mismatch(name, "optimizer state for unknown parameter"))?;
            let param_range = topology.owned_range(rank, param.values.len());

            let mut sliced = BTreeMap::new();
            for (state_name, tensor) in states {
                let key = format!("{}.{}", name, state_name);
                let range = if tensor.shape.is_empty() {
                    0..tensor.values.len()
                } else if tensor.values.len() == param.values.len() {
                    param_range.clone()
                } else {
                    return Err(Error::mismatch(
                        key,
                        "optimizer state neither scalar nor parameter-shaped",
                    ));
                };
                sliced.insert(state_name.clone(), tensor.slice_for(&key, range)?);
            }
            optimizer_fragment.insert(name.clone(), sliced);
        }

        Ok(Self {
            owner_shard_id: rank,
            model_fragment,
            optimizer_fragment,
            scheduler_fragment: global.scheduler.clone(),
            progress_counters: global.progress,
        })
    }
}

/// State handed back to a worker after a load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconstructedState {
    /// Generation the state was loaded from; `None` for a fresh start
    pub generation: Option<Generation>,

    pub model_fragment: ModelFragment,
    pub optimizer_fragment: OptimizerFragment,
    pub scheduler_fragment: Vec<u8>,

    pub total_steps: u64,
    pub resume_cursor: u64,
}

impl ReconstructedState {
    /// State for a run with no checkpoint to resume from
    pub fn fresh() -> Self {
        Self::default()
    }

    pub fn is_fresh(&self) -> bool {
        self.generation.is_none()
    }
}

/// The shard a worker wants reconstructed at load time
#[derive(Debug, Clone, PartialEq)]
pub struct TargetShard {
    /// Topology the computation is running with now
    pub topology: ShardTopology,

    /// This worker's rank in `topology`
    pub rank: Rank,

    /// Parameter shapes of the live model, used to validate alignment
    pub expected_shapes: Option<BTreeMap<ParamName, Vec<usize>>>,
}

impl TargetShard {
    pub fn new(topology: ShardTopology, rank: Rank) -> Self {
        Self {
            topology,
            rank,
            expected_shapes: None,
        }
    }

    pub fn with_expected_shapes(mut self, shapes: BTreeMap<ParamName, Vec<usize>>) -> Self {
        self.expected_shapes = Some(shapes);
        self
    }
}
