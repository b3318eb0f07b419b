use std::collections::HashMap;

use log::info;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::corpus::Corpus;
use crate::error::{Result, TrainsetError};
use crate::frame_ref::{FrameRef, UtteranceRef};

const MAX_SWAP_RETRIES: u32 = 64;

/// A chunk's placement on one sweep's timeline, plus its paging window —
/// the contiguous range of *randomized* chunk indices from which its
/// utterances/frames may draw their randomized partner.
#[derive(Debug, Clone, Copy)]
pub struct RandomizedChunk {
    pub orig_chunk_idx: usize,
    pub global_ts: u64,
    pub utt_pos_begin: usize,
    pub window_begin: usize,
    pub window_end: usize,
}

impl RandomizedChunk {
    fn global_te(&self, total_frames: usize) -> u64 {
        self.global_ts + total_frames as u64
    }
}

/// Produces, for a given sweep index, a randomized chunk order, per-chunk
/// paging windows, and either the randomized utterance or frame sequence.
/// Recomputes only when the sweep changes; otherwise every call is a no-op.
///
/// Holds no borrow of the [`Corpus`] between calls — every method takes it
/// as a parameter — so a [`crate::pager::Pager`] can hold a `&mut Corpus`
/// for paging without fighting this type for the borrow. Only indices into
/// the corpus are retained, per the "indices, not pointers" design note.
#[derive(Debug)]
pub struct Randomizer {
    randomization_range: u64,
    frame_mode: bool,
    cached_sweep: Option<u64>,
    pub randomized_chunks: Vec<RandomizedChunk>,
    pub randomized_utterances: Vec<UtteranceRef>,
    ts_to_pos: HashMap<u64, usize>,
    pub randomized_frames: Vec<FrameRef>,
    recompute_count: usize,
}

impl Randomizer {
    pub fn new(corpus: &Corpus, randomization_range: u64, frame_mode: bool) -> Result<Self> {
        let max_chunk_frames = corpus.chunks.iter().map(|c| c.total_frames).max().unwrap_or(0) as u64;
        if randomization_range < 2 * max_chunk_frames {
            return Err(TrainsetError::InvariantViolation(format!(
                "randomization_range ({randomization_range}) must be >= 2 * max_chunk_frames ({max_chunk_frames})"
            )));
        }
        Ok(Self {
            randomization_range,
            frame_mode,
            cached_sweep: None,
            randomized_chunks: Vec::new(),
            randomized_utterances: Vec::new(),
            ts_to_pos: HashMap::new(),
            randomized_frames: Vec::new(),
            recompute_count: 0,
        })
    }

    pub fn frame_mode(&self) -> bool {
        self.frame_mode
    }

    /// Test-mode hook: counts how many times `ensure_randomized_for` has
    /// actually recomputed a sweep's ordering, to check idempotence within
    /// a sweep.
    pub fn recompute_count(&self) -> usize {
        self.recompute_count
    }

    /// Idempotent: recomputes only when `sweep = global_ts / total_frames`
    /// differs from the cached sweep.
    pub fn ensure_randomized_for(&mut self, corpus: &Corpus, global_ts: u64) -> Result<u64> {
        let total = corpus.total_frames;
        if total == 0 {
            return Err(TrainsetError::InvariantViolation("corpus has zero frames".to_string()));
        }
        let sweep = global_ts / total;
        if self.cached_sweep == Some(sweep) {
            return Ok(sweep);
        }

        info!("randomizer re-seeding for sweep {sweep}");
        self.recompute_count += 1;
        let sweep_ts = sweep * total;

        self.shuffle_chunks(corpus, sweep, sweep_ts);
        self.compute_windows(corpus);
        if self.frame_mode {
            self.shuffle_frames(corpus, sweep)?;
        } else {
            self.shuffle_utterances(corpus, sweep)?;
        }

        self.cached_sweep = Some(sweep);
        Ok(sweep)
    }

    // --- Step A ---
    fn shuffle_chunks(&mut self, corpus: &Corpus, sweep: u64, sweep_ts: u64) {
        let n = corpus.chunks.len();
        let mut order: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(sweep);
        // standard swap-with-random-index (Fisher-Yates) pass
        for i in (1..n).rev() {
            let j = rng.random_range(0..=i);
            order.swap(i, j);
        }

        let mut global_ts = sweep_ts;
        let mut utt_pos_begin = 0usize;
        let mut randomized = Vec::with_capacity(n);
        for &orig_idx in &order {
            let chunk = &corpus.chunks[orig_idx];
            randomized.push(RandomizedChunk {
                orig_chunk_idx: orig_idx,
                global_ts,
                utt_pos_begin,
                window_begin: 0,
                window_end: 0,
            });
            global_ts += chunk.total_frames as u64;
            utt_pos_begin += chunk.utterance_count();
        }
        self.randomized_chunks = randomized;
    }

    // --- Step B: two-pointer window sweep, monotone in randomized-chunk index ---
    fn compute_windows(&mut self, corpus: &Corpus) {
        let n = self.randomized_chunks.len();
        let half = self.randomization_range / 2;
        let mut lo = 0usize;
        let mut hi = 0usize;

        let total_frames: Vec<usize> = self.randomized_chunks.iter().map(|rc| corpus.chunks[rc.orig_chunk_idx].total_frames).collect();

        for k in 0..n {
            let k_ts = self.randomized_chunks[k].global_ts;
            let k_te = self.randomized_chunks[k].global_te(total_frames[k]);

            while lo < k && k_ts.saturating_sub(self.randomized_chunks[lo].global_te(total_frames[lo])) > half {
                lo += 1;
            }
            if hi < k {
                hi = k;
            }
            while hi + 1 < n && self.randomized_chunks[hi + 1].global_ts.saturating_sub(k_te) <= half {
                hi += 1;
            }
            self.randomized_chunks[k].window_begin = lo;
            self.randomized_chunks[k].window_end = hi + 1;
        }
    }

    fn owning_chunk_of_pos(&self, p: usize) -> usize {
        // positions are laid out contiguously per randomized chunk in
        // ascending utt_pos_begin order; binary search the boundary.
        match self.randomized_chunks.binary_search_by(|c| c.utt_pos_begin.cmp(&p)) {
            Ok(k) => k,
            Err(k) => k - 1,
        }
    }

    fn owning_chunk_of_frame_pos(&self, t: usize) -> usize {
        let sweep_ts = self.randomized_chunks.first().map(|rc| rc.global_ts).unwrap_or(0);
        let target = sweep_ts + t as u64;
        match self.randomized_chunks.binary_search_by(|c| c.global_ts.cmp(&target)) {
            Ok(k) => k,
            Err(k) => k - 1,
        }
    }

    /// The paging window `(window_begin, window_end)` of the chunk that
    /// *defines* utterance position `p` — not of whatever utterance
    /// happens to be resident there after the Step C shuffle. Callers use
    /// this to compute a batch's residency requirement.
    pub fn window_for_pos(&self, p: usize) -> (usize, usize) {
        let owning = self.owning_chunk_of_pos(p);
        (self.randomized_chunks[owning].window_begin, self.randomized_chunks[owning].window_end)
    }

    /// Same as [`Self::window_for_pos`], but for a frame-timeline position
    /// `t` (frame mode).
    pub fn window_for_frame_pos(&self, t: usize) -> (usize, usize) {
        let owning = self.owning_chunk_of_frame_pos(t);
        (self.randomized_chunks[owning].window_begin, self.randomized_chunks[owning].window_end)
    }

    fn pos_window(&self, corpus: &Corpus, owning: usize) -> (usize, usize) {
        let rc = &self.randomized_chunks[owning];
        let begin = self.randomized_chunks[rc.window_begin].utt_pos_begin;
        let last = rc.window_end - 1;
        let end = self.randomized_chunks[last].utt_pos_begin + corpus.chunks[self.randomized_chunks[last].orig_chunk_idx].utterance_count();
        (begin, end)
    }

    // --- Step C ---
    fn shuffle_utterances(&mut self, corpus: &Corpus, sweep: u64) -> Result<()> {
        let num_utterances: usize = self.randomized_chunks.iter().map(|rc| corpus.chunks[rc.orig_chunk_idx].utterance_count()).sum();

        let mut refs = Vec::with_capacity(num_utterances);
        for (rc_idx, rc) in self.randomized_chunks.iter().enumerate() {
            let chunk = &corpus.chunks[rc.orig_chunk_idx];
            for (utt_idx, u) in chunk.utterances.iter().enumerate() {
                refs.push(UtteranceRef {
                    chunk_idx: rc_idx,
                    utt_idx,
                    num_frames: u.num_frames,
                    global_ts: 0, // filled below
                });
            }
        }

        let mut rng = StdRng::seed_from_u64(sweep + 1);
        for i in 0..refs.len() {
            let owning = self.owning_chunk_of_pos(i);
            let (pos_begin, pos_end) = self.pos_window(corpus, owning);
            if pos_end <= pos_begin + 1 {
                continue; // degenerate window of size 1: nothing to swap
            }

            let mut tries = 0;
            loop {
                let j = rng.random_range(pos_begin..pos_end);
                if j == i {
                    break; // self-swap: silently skipped
                }
                let owning_j = self.owning_chunk_of_pos(j);

                let resident_i_chunk = refs[i].chunk_idx;
                let resident_j_chunk = refs[j].chunk_idx;

                let i_accepts_j = resident_j_chunk >= self.randomized_chunks[owning].window_begin
                    && resident_j_chunk < self.randomized_chunks[owning].window_end;
                let j_accepts_i = resident_i_chunk >= self.randomized_chunks[owning_j].window_begin
                    && resident_i_chunk < self.randomized_chunks[owning_j].window_end;

                if i_accepts_j && j_accepts_i {
                    refs.swap(i, j);
                    break;
                }

                tries += 1;
                if tries >= MAX_SWAP_RETRIES {
                    return Err(TrainsetError::InvariantViolation(format!(
                        "utterance swap admissibility retry cap exhausted at position {i}"
                    )));
                }
            }
        }

        // fix up global_ts by cumulative sum, build the boundary dictionary
        let sweep_ts = self.randomized_chunks.first().map(|rc| rc.global_ts).unwrap_or(0);
        let mut ts = sweep_ts;
        let mut ts_to_pos = HashMap::with_capacity(refs.len());
        for (p, r) in refs.iter_mut().enumerate() {
            r.global_ts = ts;
            ts_to_pos.insert(ts, p);
            ts += r.num_frames as u64;
        }

        self.randomized_utterances = refs;
        self.ts_to_pos = ts_to_pos;
        Ok(())
    }

    // --- Step D ---
    fn shuffle_frames(&mut self, corpus: &Corpus, sweep: u64) -> Result<()> {
        let total = corpus.total_frames as usize;
        let mut refs = Vec::with_capacity(total);
        let mut t_to_chunk = Vec::with_capacity(total);

        for (rc_idx, rc) in self.randomized_chunks.iter().enumerate() {
            let chunk = &corpus.chunks[rc.orig_chunk_idx];
            for (utt_idx, u) in chunk.utterances.iter().enumerate() {
                for f in 0..u.num_frames {
                    refs.push(FrameRef::new(rc_idx, utt_idx, f)?);
                    t_to_chunk.push(rc_idx);
                }
            }
        }

        let mut rng = StdRng::seed_from_u64(sweep + 1);
        for t in 0..refs.len() {
            let owning = t_to_chunk[t];
            let window_begin_frame = self.randomized_chunks[self.randomized_chunks[owning].window_begin].global_ts;
            let last = self.randomized_chunks[owning].window_end - 1;
            let window_end_frame =
                self.randomized_chunks[last].global_te(corpus.chunks[self.randomized_chunks[last].orig_chunk_idx].total_frames);
            let sweep_ts = self.randomized_chunks[0].global_ts;
            let lo = (window_begin_frame - sweep_ts) as usize;
            let hi = (window_end_frame - sweep_ts) as usize;
            if hi <= lo + 1 {
                continue;
            }

            let mut tries = 0;
            loop {
                let tswap = rng.random_range(lo..hi);
                if tswap == t {
                    break;
                }
                let owning_swap = t_to_chunk[tswap];

                let t_chunk_of_swap_resident = t_to_chunk[tswap];
                let swap_chunk_of_t_resident = t_to_chunk[t];

                let t_accepts = t_chunk_of_swap_resident >= self.randomized_chunks[owning].window_begin
                    && t_chunk_of_swap_resident < self.randomized_chunks[owning].window_end;
                let swap_accepts = swap_chunk_of_t_resident >= self.randomized_chunks[owning_swap].window_begin
                    && swap_chunk_of_t_resident < self.randomized_chunks[owning_swap].window_end;

                if t_accepts && swap_accepts {
                    refs.swap(t, tswap);
                    t_to_chunk.swap(t, tswap);
                    break;
                }

                tries += 1;
                if tries >= MAX_SWAP_RETRIES {
                    return Err(TrainsetError::InvariantViolation(format!(
                        "frame swap admissibility retry cap exhausted at position {t}"
                    )));
                }
            }
        }

        self.randomized_frames = refs;
        Ok(())
    }

    /// Smallest boundary `>= global_ts` (utterance mode), `global_ts`
    /// unchanged (frame mode).
    pub fn first_valid_global_ts(&mut self, corpus: &Corpus, global_ts: u64) -> Result<u64> {
        if self.frame_mode {
            return Ok(global_ts);
        }
        self.ensure_randomized_for(corpus, global_ts)?;
        let mut best: Option<u64> = None;
        for &ts in self.ts_to_pos.keys() {
            if ts >= global_ts && best.is_none_or(|b| ts < b) {
                best = Some(ts);
            }
        }
        match best {
            Some(ts) => Ok(ts),
            None => {
                // past the end of this sweep: first boundary of the next one
                let next_sweep_ts = (self.cached_sweep.unwrap() + 1) * corpus.total_frames;
                Ok(next_sweep_ts)
            }
        }
    }

    pub fn position_for(&self, global_ts: u64) -> Option<usize> {
        self.ts_to_pos.get(&global_ts).copied()
    }

    pub fn resolve_frame(&self, t: usize) -> Option<(usize, usize, usize)> {
        self.randomized_frames.get(t).map(|r| (r.chunk_idx(), r.utt_idx(), r.frame_idx()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FeatureInfo, FeatureReader};
    use crate::corpus::{CorpusInputs, FeatureFileEntry};
    use std::collections::HashSet;

    struct FakeReader;
    impl FeatureReader for FakeReader {
        fn get_info(&self, _path: &str) -> Result<FeatureInfo> {
            Ok(FeatureInfo {
                feat_kind: 0,
                feat_dim: 1,
                samp_period: 100_000,
            })
        }
        fn read(&self, _path: &str, _expected: &FeatureInfo, _num_frames: usize, _out: &mut [f32]) -> Result<()> {
            Ok(())
        }
    }

    fn make_corpus(utt_frames: &[usize], chunk_target: usize) -> Corpus {
        let reader = FakeReader;
        let entries: Vec<_> = utt_frames
            .iter()
            .enumerate()
            .map(|(i, &n)| FeatureFileEntry {
                path: format!("u{i}.feat"),
                key: format!("u{i}"),
                num_frames: n,
            })
            .collect();
        Corpus::build(CorpusInputs {
            feature_files: entries,
            labels: None,
            lattice_source: None,
            feature_reader: &reader,
            u_dim: 10,
            chunk_target_frames: chunk_target,
        })
        .unwrap()
    }

    #[test]
    fn utterance_coverage_holds() {
        let corpus = make_corpus(&[3, 4, 5, 2, 6, 3, 4], 6);
        let range = 2 * corpus.chunks.iter().map(|c| c.total_frames).max().unwrap() as u64;
        let mut r = Randomizer::new(&corpus, range.max(20), false).unwrap();
        r.ensure_randomized_for(&corpus, 0).unwrap();

        let mut seen: HashSet<(usize, usize)> = HashSet::new();
        for u in &r.randomized_utterances {
            let orig = r.randomized_chunks[u.chunk_idx].orig_chunk_idx;
            assert!(seen.insert((orig, u.utt_idx)));
        }
        let total_utts: usize = corpus.chunks.iter().map(|c| c.utterance_count()).sum();
        assert_eq!(seen.len(), total_utts);
    }

    #[test]
    fn timeline_continuity_holds() {
        let corpus = make_corpus(&[3, 4, 5, 2, 6, 3, 4], 6);
        let range = 2 * corpus.chunks.iter().map(|c| c.total_frames).max().unwrap() as u64;
        let mut r = Randomizer::new(&corpus, range.max(20), false).unwrap();
        r.ensure_randomized_for(&corpus, 0).unwrap();

        assert_eq!(r.randomized_utterances[0].global_ts, 0);
        for w in r.randomized_utterances.windows(2) {
            assert_eq!(w[1].global_ts, w[0].global_ts + w[0].num_frames as u64);
        }
    }

    #[test]
    fn determinism_across_runs() {
        let corpus = make_corpus(&[3, 4, 5, 2, 6, 3, 4, 5, 6], 6);
        let range = 2 * corpus.chunks.iter().map(|c| c.total_frames).max().unwrap() as u64;

        let mut r1 = Randomizer::new(&corpus, range.max(20), false).unwrap();
        r1.ensure_randomized_for(&corpus, 0).unwrap();
        let mut r2 = Randomizer::new(&corpus, range.max(20), false).unwrap();
        r2.ensure_randomized_for(&corpus, 0).unwrap();

        let a: Vec<_> = r1.randomized_utterances.iter().map(|u| (u.chunk_idx, u.utt_idx)).collect();
        let b: Vec<_> = r2.randomized_utterances.iter().map(|u| (u.chunk_idx, u.utt_idx)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn idempotent_within_same_sweep() {
        let corpus = make_corpus(&[3, 4, 5, 2, 6, 3, 4], 6);
        let range = 2 * corpus.chunks.iter().map(|c| c.total_frames).max().unwrap() as u64;
        let mut r = Randomizer::new(&corpus, range.max(20), false).unwrap();
        r.ensure_randomized_for(&corpus, 0).unwrap();
        r.ensure_randomized_for(&corpus, 3).unwrap();
        assert_eq!(r.recompute_count(), 1);
    }

    #[test]
    fn rejects_too_small_randomization_range() {
        let corpus = make_corpus(&[3, 4, 5], 3);
        let err = Randomizer::new(&corpus, 1, false).unwrap_err();
        assert!(matches!(err, TrainsetError::InvariantViolation(_)));
    }

    #[test]
    fn frame_mode_coverage_holds() {
        let corpus = make_corpus(&[3, 4, 5, 2, 6, 3, 4], 6);
        let range = 2 * corpus.chunks.iter().map(|c| c.total_frames).max().unwrap() as u64;
        let mut r = Randomizer::new(&corpus, range.max(20), true).unwrap();
        r.ensure_randomized_for(&corpus, 0).unwrap();

        let mut seen: HashSet<(usize, usize, usize)> = HashSet::new();
        for fr in &r.randomized_frames {
            let orig = r.randomized_chunks[fr.chunk_idx()].orig_chunk_idx;
            assert!(seen.insert((orig, fr.utt_idx(), fr.frame_idx())));
        }
        assert_eq!(seen.len(), corpus.total_frames as usize);
    }
}
