use log::{debug, error, warn};

use crate::collaborators::{FeatureReader, LatticeSource};
use crate::corpus::Corpus;
use crate::error::{Result, TrainsetError};
use crate::randomizer::RandomizedChunk;

/// Owns chunk residency: "all chunks in the current position's window are
/// resident; others may be evicted." `require`/`release` operate on
/// *randomized* chunk indices; the pager resolves them to the underlying
/// corpus chunk.
pub struct Pager<'a> {
    feature_reader: &'a dyn FeatureReader,
    lattice_source: Option<&'a dyn LatticeSource>,
    max_retries: u32,
}

impl<'a> Pager<'a> {
    pub fn new(feature_reader: &'a dyn FeatureReader, lattice_source: Option<&'a dyn LatticeSource>, max_retries: u32) -> Self {
        Self {
            feature_reader,
            lattice_source,
            max_retries,
        }
    }

    /// Loads `randomized_chunks[chunk_idx]`'s frames (and lattices) if not
    /// already resident. Fails fatally if `chunk_idx` is outside the given
    /// window. Returns `true` if a read happened.
    pub fn require(&self, corpus: &mut Corpus, randomized_chunks: &[RandomizedChunk], chunk_idx: usize, window_begin: usize, window_end: usize) -> Result<bool> {
        if chunk_idx < window_begin || chunk_idx >= window_end {
            return Err(TrainsetError::InvariantViolation(format!(
                "require({chunk_idx}) outside window [{window_begin}, {window_end})"
            )));
        }

        let orig_idx = randomized_chunks[chunk_idx].orig_chunk_idx;
        if corpus.chunks[orig_idx].is_resident() {
            return Ok(false);
        }

        let mut last_err = None;
        for attempt in 1..=self.max_retries {
            match self.load(corpus, orig_idx) {
                Ok(()) => {
                    debug!("paged in chunk {orig_idx} (randomized idx {chunk_idx})");
                    return Ok(true);
                }
                Err(e) => {
                    warn!("transient read failure loading chunk {orig_idx} (attempt {attempt}/{}): {e}", self.max_retries);
                    last_err = Some(e);
                }
            }
        }

        corpus.chunks[orig_idx].residency.release();
        let err = last_err.expect("loop runs at least once");
        error!("giving up on chunk {orig_idx} after {} attempts: {err}", self.max_retries);
        Err(err)
    }

    pub fn release(&self, corpus: &mut Corpus, randomized_chunks: &[RandomizedChunk], chunk_idx: usize) {
        let orig_idx = randomized_chunks[chunk_idx].orig_chunk_idx;
        if corpus.chunks[orig_idx].is_resident() {
            debug!("paged out chunk {orig_idx} (randomized idx {chunk_idx})");
            corpus.chunks[orig_idx].residency.release();
        }
    }

    fn load(&self, corpus: &mut Corpus, orig_idx: usize) -> Result<()> {
        let feature_info = corpus.feature_info;
        let chunk = &mut corpus.chunks[orig_idx];
        let mut frames = vec![0f32; feature_info.feat_dim * chunk.total_frames];
        let mut lattices = Vec::with_capacity(chunk.utterance_count());

        for (i, u) in chunk.utterances.iter().enumerate() {
            let start = chunk.first_frames[i] * feature_info.feat_dim;
            let end = start + u.num_frames * feature_info.feat_dim;
            self.feature_reader
                .read(&u.archive_path, &feature_info, u.num_frames, &mut frames[start..end])?;

            let lattice = if u.has_lattice {
                match self.lattice_source {
                    Some(src) => Some(src.get_lattice(&u.key, u.num_frames)?),
                    None => None,
                }
            } else {
                None
            };
            lattices.push(lattice);
        }

        chunk.residency.frames = Some(frames);
        chunk.residency.lattices = Some(lattices);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::FeatureInfo;
    use crate::corpus::{CorpusInputs, FeatureFileEntry};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyReader {
        fail_times: AtomicU32,
    }
    impl FeatureReader for FlakyReader {
        fn get_info(&self, _path: &str) -> Result<FeatureInfo> {
            Ok(FeatureInfo {
                feat_kind: 0,
                feat_dim: 2,
                samp_period: 100_000,
            })
        }
        fn read(&self, _path: &str, _expected: &FeatureInfo, num_frames: usize, out: &mut [f32]) -> Result<()> {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(TrainsetError::Io {
                    path: "flaky".to_string(),
                    source: "simulated transient failure".to_string(),
                });
            }
            out[..num_frames * 2].fill(1.0);
            Ok(())
        }
    }

    fn build_corpus(reader: &dyn FeatureReader) -> Corpus {
        let entries = vec![
            FeatureFileEntry { path: "a".into(), key: "a".into(), num_frames: 4 },
            FeatureFileEntry { path: "b".into(), key: "b".into(), num_frames: 5 },
        ];
        Corpus::build(CorpusInputs {
            feature_files: entries,
            labels: None,
            lattice_source: None,
            feature_reader: reader,
            u_dim: 10,
            chunk_target_frames: 100,
        })
        .unwrap()
    }

    fn identity_randomized(corpus: &Corpus) -> Vec<RandomizedChunk> {
        corpus
            .chunks
            .iter()
            .enumerate()
            .map(|(i, _)| RandomizedChunk {
                orig_chunk_idx: i,
                global_ts: 0,
                utt_pos_begin: 0,
                window_begin: 0,
                window_end: corpus.chunks.len(),
            })
            .collect()
    }

    #[test]
    fn require_retries_then_succeeds() {
        let reader = FlakyReader { fail_times: AtomicU32::new(2) };
        let mut corpus = build_corpus(&reader);
        let randomized = identity_randomized(&corpus);
        let pager = Pager::new(&reader, None, 5);

        let paged_in = pager.require(&mut corpus, &randomized, 0, 0, 1).unwrap();
        assert!(paged_in);
        assert!(corpus.chunks[0].is_resident());
    }

    #[test]
    fn require_exhausts_retries_and_leaves_nonresident() {
        let reader = FlakyReader { fail_times: AtomicU32::new(10) };
        let mut corpus = build_corpus(&reader);
        let randomized = identity_randomized(&corpus);
        let pager = Pager::new(&reader, None, 3);

        let result = pager.require(&mut corpus, &randomized, 0, 0, 1);
        assert!(result.is_err());
        assert!(!corpus.chunks[0].is_resident());
    }

    #[test]
    fn require_is_noop_when_already_resident() {
        let reader = FlakyReader { fail_times: AtomicU32::new(0) };
        let mut corpus = build_corpus(&reader);
        let randomized = identity_randomized(&corpus);
        let pager = Pager::new(&reader, None, 5);

        assert!(pager.require(&mut corpus, &randomized, 0, 0, 1).unwrap());
        assert!(!pager.require(&mut corpus, &randomized, 0, 0, 1).unwrap());
    }

    #[test]
    fn require_outside_window_is_fatal() {
        let reader = FlakyReader { fail_times: AtomicU32::new(0) };
        let mut corpus = build_corpus(&reader);
        let randomized = identity_randomized(&corpus);
        let pager = Pager::new(&reader, None, 5);

        let err = pager.require(&mut corpus, &randomized, 0, 1, 2).unwrap_err();
        assert!(matches!(err, TrainsetError::InvariantViolation(_)));
    }

    #[test]
    fn release_is_noop_when_not_resident() {
        let reader = FlakyReader { fail_times: AtomicU32::new(0) };
        let mut corpus = build_corpus(&reader);
        let randomized = identity_randomized(&corpus);
        let pager = Pager::new(&reader, None, 5);
        pager.release(&mut corpus, &randomized, 0);
        assert!(!corpus.chunks[0].is_resident());
    }
}
