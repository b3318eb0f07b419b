mod assembler;
mod chunk;
mod collaborators;
mod config;
mod corpus;
mod error;
mod frame_ref;
mod pager;
mod randomizer;
mod utterance;

pub use assembler::{Batch, BatchAssembler};
pub use chunk::{Chunk, Residency};
pub use collaborators::{
    Augmentor, BoundaryFlags, FeatureInfo, FeatureReader, FrameLabel, LatticePair, LatticeSource, NeighborAugmentor,
};
pub use config::TrainsetConfig;
pub use corpus::{Corpus, CorpusInputs, FeatureFileEntry};
pub use error::{Result, TrainsetError};
pub use frame_ref::{FrameRef, UtteranceRef, MAX_FRAMES_PER_UTTERANCE, MAX_UTTERANCES_PER_CHUNK};
pub use pager::Pager;
pub use randomizer::{RandomizedChunk, Randomizer};
pub use utterance::{Utterance, SENTINEL};

/// Sets the process-wide max log level used by this crate's diagnostics
/// (paging, re-seeding, batch composition). Since the crate never installs
/// its own logger (the host application does), this maps straight onto
/// [`log::set_max_level`].
pub fn set_verbosity(level: u8) {
    let filter = match level {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    log::set_max_level(filter);
}
