use std::collections::HashMap;
use std::sync::Mutex;

use deli_trainset::{
    BoundaryFlags, Corpus, CorpusInputs, FeatureFileEntry, FeatureInfo, FeatureReader, FrameLabel,
    LatticePair, LatticeSource, TrainsetError,
};

/// In-memory feature reader: every utterance is a flat ramp `key_hash + t`
/// so frame identity is recoverable from its value in assertions.
pub struct InMemoryFeatureReader {
    pub feat_dim: usize,
}

impl FeatureReader for InMemoryFeatureReader {
    fn get_info(&self, _path: &str) -> deli_trainset::Result<FeatureInfo> {
        Ok(FeatureInfo {
            feat_kind: 0,
            feat_dim: self.feat_dim,
            samp_period: 100_000,
        })
    }

    fn read(&self, _path: &str, _expected: &FeatureInfo, num_frames: usize, out: &mut [f32]) -> deli_trainset::Result<()> {
        out[..num_frames * self.feat_dim].fill(1.0);
        Ok(())
    }
}

/// Feature reader that counts how many times each archive path is read, so
/// tests can assert a chunk is never paged in twice within a sweep.
#[derive(Default)]
pub struct CountingFeatureReader {
    pub feat_dim: usize,
    pub read_counts: Mutex<HashMap<String, u32>>,
}

impl CountingFeatureReader {
    pub fn new(feat_dim: usize) -> Self {
        Self {
            feat_dim,
            read_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_reads_per_path(&self) -> u32 {
        self.read_counts.lock().unwrap().values().copied().max().unwrap_or(0)
    }
}

impl FeatureReader for CountingFeatureReader {
    fn get_info(&self, _path: &str) -> deli_trainset::Result<FeatureInfo> {
        Ok(FeatureInfo {
            feat_kind: 0,
            feat_dim: self.feat_dim,
            samp_period: 100_000,
        })
    }

    fn read(&self, path: &str, _expected: &FeatureInfo, num_frames: usize, out: &mut [f32]) -> deli_trainset::Result<()> {
        *self.read_counts.lock().unwrap().entry(path.to_string()).or_insert(0) += 1;
        out[..num_frames * self.feat_dim].fill(1.0);
        Ok(())
    }
}

/// Lattice source that has a lattice for every key except those listed in
/// `missing`, recording every `get_lattice` call so tests can assert on
/// access patterns.
#[derive(Default)]
pub struct InMemoryLatticeSource {
    pub missing: Vec<String>,
    pub calls: Mutex<Vec<String>>,
}

impl LatticeSource for InMemoryLatticeSource {
    fn has_lattice(&self, key: &str) -> bool {
        !self.missing.iter().any(|m| m == key)
    }

    fn get_lattice(&self, key: &str, expected_cols: usize) -> deli_trainset::Result<LatticePair> {
        self.calls.lock().unwrap().push(key.to_string());
        Ok(LatticePair {
            numerator: vec![0u8; expected_cols],
            denominator: vec![0u8; expected_cols],
        })
    }
}

pub fn entries(counts: &[usize]) -> Vec<FeatureFileEntry> {
    counts
        .iter()
        .enumerate()
        .map(|(i, &n)| FeatureFileEntry {
            path: format!("u{i}.feat"),
            key: format!("u{i}"),
            num_frames: n,
        })
        .collect()
}

pub fn labels_for_all(counts: &[usize], class_id: i32) -> HashMap<String, Vec<FrameLabel>> {
    counts
        .iter()
        .enumerate()
        .map(|(i, &n)| {
            (
                format!("u{i}"),
                vec![FrameLabel {
                    first_frame: 0,
                    num_frames: n,
                    class_id,
                }],
            )
        })
        .collect()
}

pub fn build_corpus(reader: &dyn FeatureReader, utt_frames: &[usize], chunk_target: usize) -> Corpus {
    Corpus::build(CorpusInputs {
        feature_files: entries(utt_frames),
        labels: None,
        lattice_source: None,
        feature_reader: reader,
        u_dim: 10,
        chunk_target_frames: chunk_target,
    })
    .unwrap()
}

#[allow(dead_code)]
pub fn boundary_flags(num_frames: usize) -> BoundaryFlags {
    BoundaryFlags { num_frames }
}

#[allow(dead_code)]
pub fn is_construction_rejected(err: &TrainsetError) -> bool {
    matches!(err, TrainsetError::ConstructionRejected(_))
}
