use std::collections::HashMap;

use deli_base::Tensor;
use log::debug;

use crate::collaborators::{Augmentor, BoundaryFlags, LatticePair};
use crate::config::TrainsetConfig;
use crate::corpus::Corpus;
use crate::error::{Result, TrainsetError};
use crate::pager::Pager;
use crate::randomizer::Randomizer;

/// One minibatch: a `[frames, v_dim]` feature tensor (frame-major), per-frame
/// label ids, and optional per-utterance transcripts/lattices (utterance
/// mode only — frame mode has no notion of "the utterance this frame
/// belongs to" at the batch level).
#[derive(Debug)]
pub struct Batch {
    pub feat: Tensor<f32>,
    pub uids: Vec<i32>,
    pub transcripts: Vec<Option<String>>,
    pub lattices: Vec<Option<LatticePair>>,
    pub paged_in: bool,
}

pub struct BatchAssembler<'a> {
    corpus: Corpus,
    randomizer: Randomizer,
    pager: Pager<'a>,
    augmentor: &'a dyn Augmentor,
    word_transcripts: HashMap<String, String>,
    resident_union: Vec<usize>,
}

impl<'a> BatchAssembler<'a> {
    pub fn new(
        corpus: Corpus,
        randomization_range: u64,
        frame_mode: bool,
        pager: Pager<'a>,
        augmentor: &'a dyn Augmentor,
        word_transcripts: HashMap<String, String>,
    ) -> Result<Self> {
        let randomizer = Randomizer::new(&corpus, randomization_range, frame_mode)?;
        Ok(Self {
            corpus,
            randomizer,
            pager,
            augmentor,
            word_transcripts,
            resident_union: Vec::new(),
        })
    }

    /// Build an assembler using the policy knobs (`randomization_range`,
    /// `frame_mode`) carried by a [`TrainsetConfig`]; the augmentor should
    /// come from [`TrainsetConfig::augmentor`].
    pub fn from_config(
        config: &TrainsetConfig,
        corpus: Corpus,
        pager: Pager<'a>,
        augmentor: &'a dyn Augmentor,
        word_transcripts: HashMap<String, String>,
    ) -> Result<Self> {
        Self::new(corpus, config.randomization_range, config.frame_mode, pager, augmentor, word_transcripts)
    }

    pub fn total_frames(&self) -> u64 {
        self.corpus.total_frames
    }

    pub fn unit_counts(&self) -> &[u64] {
        &self.corpus.unit_counts
    }

    /// Original chunk indices currently paged in. Exposed so callers (and
    /// tests) can check the residency law directly instead of trusting
    /// `get_batch` not to have panicked.
    pub fn resident_chunk_indices(&self) -> Vec<usize> {
        self.corpus
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_resident())
            .map(|(i, _)| i)
            .collect()
    }

    /// Read-only access to the randomizer, so callers can relate a
    /// timeline position back to its defining chunk and residency window.
    pub fn randomizer(&self) -> &Randomizer {
        &self.randomizer
    }

    pub fn first_valid_global_ts(&mut self, global_ts: u64) -> Result<u64> {
        self.randomizer.first_valid_global_ts(&self.corpus, global_ts)
    }

    fn repage(&mut self, new_window: &[usize]) -> Result<bool> {
        let mut paged_in = false;
        for &idx in &self.resident_union {
            if !new_window.contains(&idx) {
                self.pager.release(&mut self.corpus, &self.randomizer.randomized_chunks, idx);
            }
        }
        for &idx in new_window {
            let rc = &self.randomizer.randomized_chunks;
            let window_begin = rc[idx].window_begin.min(idx);
            let window_end = rc[idx].window_end.max(idx + 1);
            if self
                .pager
                .require(&mut self.corpus, &self.randomizer.randomized_chunks, idx, window_begin, window_end)?
            {
                paged_in = true;
            }
        }
        self.resident_union = new_window.to_vec();
        Ok(paged_in)
    }

    pub fn get_batch(&mut self, global_ts: u64, frames_requested: usize) -> Result<Batch> {
        if self.randomizer.frame_mode() {
            self.get_batch_frame_mode(global_ts, frames_requested)
        } else {
            self.get_batch_utterance_mode(global_ts, frames_requested)
        }
    }

    fn get_batch_utterance_mode(&mut self, global_ts: u64, frames_requested: usize) -> Result<Batch> {
        self.randomizer.ensure_randomized_for(&self.corpus, global_ts)?;

        let spos = self
            .randomizer
            .position_for(global_ts)
            .ok_or_else(|| TrainsetError::InvariantViolation(format!("global_ts {global_ts} is not a valid utterance boundary")))?;

        let utterances = &self.randomizer.randomized_utterances;
        let mut epos = spos + 1;
        let mut total = utterances[spos].num_frames;
        while epos < utterances.len() && total + utterances[epos].num_frames < frames_requested {
            total += utterances[epos].num_frames;
            epos += 1;
        }

        // the residency window is defined by the *position*, not by
        // whichever utterance the Step C shuffle happened to leave there.
        let (window_begin, _) = self.randomizer.window_for_pos(spos);
        let (_, window_end) = self.randomizer.window_for_pos(epos - 1);
        let union: Vec<usize> = (window_begin..window_end).collect();
        let paged_in = self.repage(&union)?;

        let feat_dim = self.corpus.feature_info.feat_dim;
        let v_dim = self.augmentor.v_dim();
        let mut feat = vec![0f32; v_dim * total];
        let mut uids = vec![0i32; total];
        let mut transcripts = Vec::with_capacity(epos - spos);
        let mut lattices = Vec::with_capacity(epos - spos);

        let mut col = 0usize;
        for p in spos..epos {
            let uref = self.randomizer.randomized_utterances[p];
            let rc = self.randomizer.randomized_chunks[uref.chunk_idx];
            let chunk = &self.corpus.chunks[rc.orig_chunk_idx];
            let utt = &chunk.utterances[uref.utt_idx];
            let src_start = chunk.first_frames[uref.utt_idx] * feat_dim;
            let source = &chunk.residency.frames.as_ref().expect("chunk must be resident")
                [src_start..src_start + utt.num_frames * feat_dim];

            for t in 0..utt.num_frames {
                self.augmentor.augment(
                    source,
                    feat_dim,
                    BoundaryFlags { num_frames: utt.num_frames },
                    t,
                    &mut feat[(col + t) * v_dim..(col + t + 1) * v_dim],
                );
                uids[col + t] = self.corpus.labels[utt.label_offset + t];
            }
            col += utt.num_frames;

            transcripts.push(self.word_transcripts.get(&utt.key).cloned());
            lattices.push(chunk.residency.lattices.as_ref().and_then(|l| l[uref.utt_idx].clone()));
        }

        debug!("assembled utterance-mode batch: {} utterances, {} frames", epos - spos, total);

        Ok(Batch {
            feat: Tensor::new(vec![total, v_dim], feat).expect("feat buffer sized to total * v_dim"),
            uids,
            transcripts,
            lattices,
            paged_in,
        })
    }

    fn get_batch_frame_mode(&mut self, global_ts: u64, frames_requested: usize) -> Result<Batch> {
        let sweep = self.randomizer.ensure_randomized_for(&self.corpus, global_ts)?;
        let total_frames = self.corpus.total_frames;
        let sweep_te = (sweep + 1) * total_frames;
        let global_te = (global_ts + frames_requested as u64).min(sweep_te);
        let mb_frames = (global_te - global_ts) as usize;

        let first_t = (global_ts % total_frames) as usize;
        let last_t = first_t + mb_frames - 1;

        // the residency window is defined by the positions' own defining
        // chunks, not by whichever frame the Step D shuffle left resident there.
        let (window_begin, _) = self.randomizer.window_for_frame_pos(first_t);
        let (_, window_end) = self.randomizer.window_for_frame_pos(last_t);
        let union: Vec<usize> = (window_begin..window_end).collect();
        let paged_in = self.repage(&union)?;

        let feat_dim = self.corpus.feature_info.feat_dim;
        let v_dim = self.augmentor.v_dim();
        let mut feat = vec![0f32; v_dim * mb_frames];
        let mut uids = vec![0i32; mb_frames];

        for j in 0..mb_frames {
            let t = (global_ts as usize + j) % total_frames as usize;
            let (chunk_idx, utt_idx, frame_idx) = self
                .randomizer
                .resolve_frame(t)
                .ok_or_else(|| TrainsetError::InvariantViolation(format!("no frame ref at position {t}")))?;
            let rc = self.randomizer.randomized_chunks[chunk_idx];
            let chunk = &self.corpus.chunks[rc.orig_chunk_idx];
            let utt = &chunk.utterances[utt_idx];
            let src_start = chunk.first_frames[utt_idx] * feat_dim;
            let source = &chunk.residency.frames.as_ref().expect("chunk must be resident")
                [src_start..src_start + utt.num_frames * feat_dim];

            self.augmentor.augment(
                source,
                feat_dim,
                BoundaryFlags { num_frames: utt.num_frames },
                frame_idx,
                &mut feat[j * v_dim..(j + 1) * v_dim],
            );
            uids[j] = self.corpus.labels[utt.label_offset + frame_idx];
        }

        debug!("assembled frame-mode batch: {mb_frames} frames");

        Ok(Batch {
            feat: Tensor::new(vec![mb_frames, v_dim], feat).expect("feat buffer sized to mb_frames * v_dim"),
            uids,
            transcripts: Vec::new(),
            lattices: Vec::new(),
            paged_in,
        })
    }
}
