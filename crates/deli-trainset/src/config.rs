use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::collaborators::NeighborAugmentor;
use crate::error::{Result, TrainsetError};

/// Policy knobs for a [`crate::Corpus`]/[`crate::BatchAssembler`] pair.
///
/// Collaborator wiring (feature readers, lattice sources, ...) is passed
/// separately to the constructors; this struct only carries values that are
/// plain data and may reasonably come from a config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainsetConfig {
    pub v_dim: usize,
    pub u_dim: usize,
    pub left_context: usize,
    pub right_context: usize,
    pub randomization_range: u64,
    pub frame_mode: bool,
    #[serde(default = "default_chunk_target_frames")]
    pub chunk_target_frames: usize,
    #[serde(default = "default_max_io_retries")]
    pub max_io_retries: u32,
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
}

fn default_chunk_target_frames() -> usize {
    // 100 frames/sec * 15 min
    100 * 15 * 60
}

fn default_max_io_retries() -> u32 {
    5
}

fn default_verbosity() -> u8 {
    2 // maps to log::LevelFilter::Info
}

impl TrainsetConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            TrainsetError::ConstructionRejected(format!("failed to parse trainset config: {e}"))
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| TrainsetError::Io {
            path: path.display().to_string(),
            source: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    pub fn verbosity_filter(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    /// Build the default neighbor-context augmentor for this config's
    /// `v_dim`/`left_context`/`right_context`.
    pub fn augmentor(&self) -> NeighborAugmentor {
        NeighborAugmentor::new(self.v_dim, self.left_context, self.right_context)
    }
}
