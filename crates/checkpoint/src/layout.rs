//! On-storage naming of checkpoint records
//!
//! ```text
//! <model_type>-<generation>steps/
//!     shard-00000.ckpt
//!     shard-00001.ckpt
//!     .metadata          <- completion marker, written last
//! ```

use runtime_core::{Generation, Rank};

/// Name of the completion marker inside a generation directory
pub const MARKER_FILE: &str = ".metadata";

const GENERATION_SUFFIX: &str = "steps";

/// Maps generations and ranks to storage paths for one model type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLayout {
    model_type: String,
}

impl CheckpointLayout {
    pub fn new(model_type: impl Into<String>) -> Self {
        Self {
            model_type: model_type.into(),
        }
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    /// `<model_type>-<generation>steps`
    pub fn dir_name(&self, generation: Generation) -> String {
        format!("{}-{}{}", self.model_type, generation.0, GENERATION_SUFFIX)
    }

    /// Prefix that lists everything stored for `generation`
    pub fn dir_prefix(&self, generation: Generation) -> String {
        format!("{}/", self.dir_name(generation))
    }

    pub fn shard_path(&self, generation: Generation, rank: Rank) -> String {
        format!("{}/{}", self.dir_name(generation), shard_file_name(rank))
    }

    pub fn marker_path(&self, generation: Generation) -> String {
        format!("{}/{}", self.dir_name(generation), MARKER_FILE)
    }

    /// Prefix shared by every generation directory of this model type
    pub fn listing_prefix(&self) -> String {
        format!("{}-", self.model_type)
    }

    /// Extract the generation from a directory name, if it is one of ours.
    ///
    /// Only the name [`dir_name`](Self::dir_name) would produce is accepted,
    /// so every generation maps to exactly one directory.
    pub fn parse_dir_name(&self, name: &str) -> Option<Generation> {
        let digits = name
            .strip_prefix(self.model_type.as_str())?
            .strip_prefix('-')?
            .strip_suffix(GENERATION_SUFFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return None;
        }
        digits.parse().ok().map(Generation)
    }

    /// Generation directory a stored path belongs to
    pub fn generation_of_path(&self, path: &str) -> Option<(Generation, String)> {
        let dir = path.split('/').next()?;
        self.parse_dir_name(dir).map(|g| (g, dir.to_string()))
    }
}

pub fn shard_file_name(rank: Rank) -> String {
    format!("shard-{:05}.ckpt", rank)
}
