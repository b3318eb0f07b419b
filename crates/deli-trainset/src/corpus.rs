use std::collections::HashMap;

use log::warn;

use crate::chunk::Chunk;
use crate::collaborators::{FeatureInfo, FeatureReader, FrameLabel, LatticeSource};
use crate::config::TrainsetConfig;
use crate::error::{Result, TrainsetError};
use crate::frame_ref::{MAX_FRAMES_PER_UTTERANCE, MAX_UTTERANCES_PER_CHUNK};
use crate::utterance::{Utterance, SENTINEL};

/// One input feature archive, already resolved to an utterance key and
/// frame count. Since no concrete path grammar is assumed, callers resolve
/// the path themselves and hand in the parsed triple.
#[derive(Debug, Clone)]
pub struct FeatureFileEntry {
    pub path: String,
    pub key: String,
    pub num_frames: usize,
}

/// Inputs to [`Corpus::build`].
pub struct CorpusInputs<'a> {
    pub feature_files: Vec<FeatureFileEntry>,
    pub labels: Option<HashMap<String, Vec<FrameLabel>>>,
    pub lattice_source: Option<&'a dyn LatticeSource>,
    pub feature_reader: &'a dyn FeatureReader,
    pub u_dim: usize,
    pub chunk_target_frames: usize,
}

/// The fixed, immutable-after-construction list of chunks plus the flat
/// label array shared across all of them.
#[derive(Debug)]
pub struct Corpus {
    pub chunks: Vec<Chunk>,
    pub labels: Vec<i32>,
    pub feature_info: FeatureInfo,
    pub unit_counts: Vec<u64>,
    pub total_frames: u64,
}

#[derive(Default)]
struct WarnCounters {
    missing_label: usize,
    missing_lattice: usize,
    duration_mismatch: usize,
    oversized: usize,
}

const WARN_CAP: usize = 5;

impl WarnCounters {
    fn fire(&mut self, counter: impl Fn(&mut Self) -> &mut usize, msg: impl Fn() -> String) {
        let n = counter(self);
        if *n < WARN_CAP {
            warn!("{}", msg());
        }
        *n += 1;
    }
}

impl Corpus {
    pub fn build(inputs: CorpusInputs) -> Result<Self> {
        if inputs.feature_files.is_empty() {
            return Err(TrainsetError::ConstructionRejected(
                "no feature files supplied".to_string(),
            ));
        }

        let supervised = inputs.labels.is_some();
        let labels_map = inputs.labels.unwrap_or_default();

        let mut feature_info: Option<FeatureInfo> = None;
        let mut flat_labels: Vec<i32> = Vec::new();
        let mut unit_counts = vec![0u64; inputs.u_dim];
        let mut accepted: Vec<Utterance> = Vec::new();

        let mut warns = WarnCounters::default();
        let total_inputs = inputs.feature_files.len();
        let mut skipped_missing = 0usize;

        for entry in &inputs.feature_files {
            let info = inputs.feature_reader.get_info(&entry.path)?;
            match feature_info {
                None => feature_info = Some(info),
                Some(expected) if expected != info => {
                    return Err(TrainsetError::FeatureMismatch {
                        expected: format!("{expected:?}"),
                        got: format!("{info:?}"),
                    });
                }
                _ => {}
            }

            if entry.num_frames < 2 {
                continue; // rejected silently: too short to be a valid utterance
            }
            if entry.num_frames > MAX_FRAMES_PER_UTTERANCE {
                warns.fire(
                    |w| &mut w.oversized,
                    || format!("utterance '{}' has {} frames, exceeding the per-utterance cap", entry.key, entry.num_frames),
                );
                continue;
            }

            let frame_labels = labels_map.get(&entry.key);
            if supervised && frame_labels.is_none() {
                warns.fire(
                    |w| &mut w.missing_label,
                    || format!("utterance '{}' has no labels", entry.key),
                );
                skipped_missing += 1;
                continue;
            }

            let has_lattice = match inputs.lattice_source {
                Some(src) => {
                    if !src.has_lattice(&entry.key) {
                        warns.fire(
                            |w| &mut w.missing_lattice,
                            || format!("utterance '{}' has no lattice", entry.key),
                        );
                        skipped_missing += 1;
                        continue;
                    }
                    true
                }
                None => false,
            };

            if let Some(segs) = frame_labels {
                let implied: usize = segs.iter().map(|s| s.first_frame + s.num_frames).max().unwrap_or(0);
                if implied != entry.num_frames {
                    warns.fire(
                        |w| &mut w.duration_mismatch,
                        || {
                            format!(
                                "utterance '{}': label duration {} disagrees with feature duration {}",
                                entry.key, implied, entry.num_frames
                            )
                        },
                    );
                    continue;
                }
            }

            let label_offset = flat_labels.len();
            if let Some(segs) = frame_labels {
                let mut per_frame = vec![SENTINEL; entry.num_frames];
                for seg in segs {
                    if seg.class_id as usize >= inputs.u_dim {
                        return Err(TrainsetError::ConstructionRejected(format!(
                            "utterance '{}': class id {} >= u_dim {}",
                            entry.key, seg.class_id, inputs.u_dim
                        )));
                    }
                    for t in seg.first_frame..seg.first_frame + seg.num_frames {
                        per_frame[t] = seg.class_id;
                        unit_counts[seg.class_id as usize] += 1;
                    }
                }
                flat_labels.extend_from_slice(&per_frame);
            } else {
                flat_labels.extend(std::iter::repeat(SENTINEL).take(entry.num_frames));
            }
            flat_labels.push(SENTINEL);

            accepted.push(Utterance::new(
                entry.path.clone(),
                entry.key.clone(),
                entry.num_frames,
                label_offset,
                has_lattice,
            ));
        }

        if total_inputs > 0 && skipped_missing * 2 > total_inputs {
            return Err(TrainsetError::ConstructionRejected(format!(
                "{skipped_missing} of {total_inputs} utterances skipped for missing labels/lattices"
            )));
        }

        if accepted.is_empty() {
            return Err(TrainsetError::ConstructionRejected(
                "no utterances survived construction".to_string(),
            ));
        }

        let feature_info = feature_info.ok_or_else(|| {
            TrainsetError::ConstructionRejected("could not determine feature metadata".to_string())
        })?;

        let chunks = chunk_utterances(accepted, inputs.chunk_target_frames);
        let total_frames = chunks.iter().map(|c| c.total_frames as u64).sum();

        Ok(Corpus {
            chunks,
            labels: flat_labels,
            feature_info,
            unit_counts,
            total_frames,
        })
    }

    /// Build a corpus using the policy knobs (`u_dim`, `chunk_target_frames`)
    /// carried by a [`TrainsetConfig`], with collaborator wiring passed
    /// separately.
    pub fn build_from_config<'a>(
        config: &TrainsetConfig,
        feature_files: Vec<FeatureFileEntry>,
        labels: Option<HashMap<String, Vec<FrameLabel>>>,
        lattice_source: Option<&'a dyn LatticeSource>,
        feature_reader: &'a dyn FeatureReader,
    ) -> Result<Self> {
        Self::build(CorpusInputs {
            feature_files,
            labels,
            lattice_source,
            feature_reader,
            u_dim: config.u_dim,
            chunk_target_frames: config.chunk_target_frames,
        })
    }
}

/// Greedily distributes utterances into chunks in input order: starts a
/// new chunk when the current one would overshoot the target frame count
/// or the bit-field utterance cap. Chunks may overshoot the target by at
/// most one utterance.
fn chunk_utterances(utterances: Vec<Utterance>, target_frames: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current: Vec<Utterance> = Vec::new();
    let mut current_frames = 0usize;

    for u in utterances {
        let would_overshoot_frames = current_frames + u.num_frames > target_frames;
        let would_overshoot_count = current.len() + 1 > MAX_UTTERANCES_PER_CHUNK;
        if !current.is_empty() && (would_overshoot_frames || would_overshoot_count) {
            chunks.push(Chunk::from_utterances(std::mem::take(&mut current)));
            current_frames = 0;
        }
        current_frames += u.num_frames;
        current.push(u);
    }
    if !current.is_empty() {
        chunks.push(Chunk::from_utterances(current));
    }
    chunks
}
