//! Topology reconciliation
//!
//! Saved shards are first flattened into a [`FlatStateDict`]: every tensor
//! (model parameter or optimizer state) becomes one flat key holding the
//! pieces each saved rank owned. Reconstruction for the current topology
//! then slices that mapping by [`ShardTopology::owned_range`], so neither
//! side needs to know how the other topology split things.
//!
//! Model fragments are rebuilt first. Optimizer state is rebuilt second,
//! against the reconstructed parameters, because whether a state tensor is
//! sharded like its parameter or replicated is decided by comparing shapes.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use runtime_core::{
    Error, Generation, ModelFragment, OptimizerFragment, ParamName, Rank, Result, StateBlob,
    TargetShard, TensorShard,
};

/// Identity of one flattened tensor
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlatKey {
    Model(ParamName),
    Optimizer { param: ParamName, state: String },
}

impl fmt::Display for FlatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatKey::Model(param) => write!(f, "model.{}", param),
            FlatKey::Optimizer { param, state } => write!(f, "optim.{}.{}", param, state),
        }
    }
}

#[derive(Debug, Clone)]
struct Piece {
    offset: usize,
    values: Vec<f32>,
}

impl Piece {
    fn end(&self) -> usize {
        self.offset + self.values.len()
    }
}

#[derive(Debug, Clone)]
struct FlatEntry {
    global_shape: Vec<usize>,
    pieces: Vec<Piece>,
}

impl FlatEntry {
    fn numel(&self) -> usize {
        self.global_shape.iter().product()
    }
}

/// Flat key -> saved pieces, independent of any topology
#[derive(Debug, Clone)]
pub struct FlatStateDict {
    generation: Generation,
    entries: BTreeMap<FlatKey, FlatEntry>,
    sealed: bool,
}

impl FlatStateDict {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            entries: BTreeMap::new(),
            sealed: false,
        }
    }

    /// Absorb one saved rank's fragments
    pub fn insert_blob(&mut self, blob: StateBlob) -> Result<()> {
        for (param, shard) in blob.model_fragment {
            self.insert(FlatKey::Model(param), shard)?;
        }
        for (param, states) in blob.optimizer_fragment {
            for (state, shard) in states {
                self.insert(
                    FlatKey::Optimizer {
                        param: param.clone(),
                        state,
                    },
                    shard,
                )?;
            }
        }
        Ok(())
    }

    fn insert(&mut self, key: FlatKey, shard: TensorShard) -> Result<()> {
        let generation = self.generation;
        let numel = shard.global_numel();
        if shard.range().end > numel {
            return Err(Error::corrupt(
                generation,
                format!("{} piece {:?} exceeds {} elements", key, shard.range(), numel),
            ));
        }

        let entry = self.entries.entry(key.clone()).or_insert_with(|| FlatEntry {
            global_shape: shard.global_shape.clone(),
            pieces: Vec::new(),
        });
        if entry.global_shape != shard.global_shape {
            return Err(Error::corrupt(
                generation,
                format!(
                    "{} saved with shapes {:?} and {:?}",
                    key, entry.global_shape, shard.global_shape
                ),
            ));
        }
        if !shard.values.is_empty() {
            entry.pieces.push(Piece {
                offset: shard.offset,
                values: shard.values,
            });
        }
        self.sealed = false;
        Ok(())
    }

    /// Order pieces and check that every element of every key was saved
    pub fn seal(&mut self) -> Result<()> {
        for (key, entry) in self.entries.iter_mut() {
            entry.pieces.sort_by_key(|p| p.offset);

            let mut covered = 0;
            for piece in &entry.pieces {
                if piece.offset > covered {
                    break;
                }
                covered = covered.max(piece.end());
            }
            let numel = entry.numel();
            if covered < numel {
                return Err(Error::corrupt(
                    self.generation,
                    format!("{} is missing elements {}..{}", key, covered, numel),
                ));
            }
        }
        self.sealed = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn global_shape(&self, key: &FlatKey) -> Option<&[usize]> {
        self.entries.get(key).map(|e| e.global_shape.as_slice())
    }

    /// Saved model parameters and their shapes
    pub fn model_shapes(&self) -> BTreeMap<ParamName, Vec<usize>> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| match key {
                FlatKey::Model(param) => Some((param.clone(), entry.global_shape.clone())),
                FlatKey::Optimizer { .. } => None,
            })
            .collect()
    }

    /// Copy out the flat elements `range` of `key`
    pub fn slice(&self, key: &FlatKey, range: Range<usize>) -> Result<Vec<f32>> {
        if !self.sealed {
            return Err(Error::Internal {
                message: "slice called before seal".to_string(),
            });
        }
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| Error::mismatch(key.to_string(), "not present in checkpoint"))?;

        let mut out = Vec::with_capacity(range.len());
        let mut cursor = range.start;
        for piece in &entry.pieces {
            if cursor >= range.end {
                break;
            }
            if piece.end() <= cursor {
                continue;
            }
            if piece.offset > cursor {
                break;
            }
            let take_end = piece.end().min(range.end);
            out.extend_from_slice(&piece.values[cursor - piece.offset..take_end - piece.offset]);
            cursor = take_end;
        }

        if cursor < range.end {
            return Err(Error::corrupt(
                self.generation,
                format!("{} has no data for elements {}..{}", key, cursor, range.end),
            ));
        }
        Ok(out)
    }

    fn shard_for(&self, key: &FlatKey, range: Range<usize>) -> Result<TensorShard> {
        let global_shape = self
            .global_shape(key)
            .map(<[usize]>::to_vec)
            .unwrap_or_default();
        let offset = range.start;
        Ok(TensorShard {
            global_shape,
            offset,
            values: self.slice(key, range)?,
        })
    }

    /// Phase one: model fragments for the target rank
    pub fn reshard_model(&self, target: &TargetShard) -> Result<ModelFragment> {
        target.topology.check_rank(target.rank)?;
        let saved = self.model_shapes();

        if let Some(expected) = &target.expected_shapes {
            for (param, shape) in expected {
                match saved.get(param) {
                    None => {
                        return Err(Error::mismatch(param, "parameter missing from checkpoint"))
                    }
                    Some(saved_shape) if saved_shape != shape => {
                        return Err(Error::mismatch(
                            param,
                            format!("saved shape {:?}, model expects {:?}", saved_shape, shape),
                        ))
                    }
                    Some(_) => {}
                }
            }
            if let Some(extra) = saved.keys().find(|p| !expected.contains_key(*p)) {
                return Err(Error::mismatch(extra, "parameter not present in live model"));
            }
        }

        let mut model = ModelFragment::new();
        for (param, shape) in saved {
            let numel: usize = shape.iter().product();
            let range = target.topology.owned_range(target.rank, numel);
            let key = FlatKey::Model(param.clone());
            model.insert(param, self.shard_for(&key, range)?);
        }
        Ok(model)
    }

    /// Phase two: optimizer state aligned with the already rebuilt `model`
    pub fn reshard_optimizer(&self, model: &ModelFragment) -> Result<OptimizerFragment> {
        let mut optimizer = OptimizerFragment::new();

        for (key, entry) in &self.entries {
            let FlatKey::Optimizer { param, state } = key else {
                continue;
            };
            let param_shard = model
                .get(param)
                .ok_or_else(|| Error::mismatch(key.to_string(), "state for unknown parameter"))?;

            let range = if entry.global_shape.is_empty() {
                0..entry.numel()
            } else if entry.numel() == param_shard.global_numel() {
                param_shard.range()
            } else {
                return Err(Error::mismatch(
                    key.to_string(),
                    format!(
                        "state shape {:?} cannot align with parameter shape {:?}",
                        entry.global_shape, param_shard.global_shape
                    ),
                ));
            };

            optimizer
                .entry(param.clone())
                .or_default()
                .insert(state.clone(), self.shard_for(key, range)?);
        }
        Ok(optimizer)
    }
}

/// Build a sealed [`FlatStateDict`] from every saved rank's blob
pub fn flatten(generation: Generation, blobs: impl IntoIterator<Item = StateBlob>) -> Result<FlatStateDict> {
    let mut flat = FlatStateDict::new(generation);
    for blob in blobs {
        flat.insert_blob(blob)?;
    }
    flat.seal()?;
    Ok(flat)
}

/// Rank whose replicated scheduler state a target rank adopts
pub fn scheduler_source(saved_world_size: usize, target_rank: Rank) -> Rank {
    if target_rank < saved_world_size {
        target_rank
    } else {
        0
    }
}
