use crate::collaborators::LatticePair;
use crate::utterance::Utterance;

/// The only mutable state on an otherwise-immutable [`Chunk`]: the dense
/// frame matrix and parallel lattice list, present only while the chunk is
/// paged in.
#[derive(Debug, Default)]
pub struct Residency {
    /// `feat_dim * total_frames` values, frame-major.
    pub frames: Option<Vec<f32>>,
    pub lattices: Option<Vec<Option<LatticePair>>>,
}

impl Residency {
    pub fn is_resident(&self) -> bool {
        self.frames.is_some()
    }

    pub fn release(&mut self) {
        self.frames = None;
        self.lattices = None;
    }
}

/// A contiguous group of utterances — the unit of paging. Metadata is
/// immutable post-construction; only `residency` mutates.
#[derive(Debug)]
pub struct Chunk {
    pub utterances: Vec<Utterance>,
    pub total_frames: usize,
    /// Prefix sums: `first_frames[i]` is utterance `i`'s first column in
    /// the chunk's frame matrix.
    pub first_frames: Vec<usize>,
    pub residency: Residency,
}

impl Chunk {
    pub fn from_utterances(utterances: Vec<Utterance>) -> Self {
        let mut first_frames = Vec::with_capacity(utterances.len());
        let mut total_frames = 0usize;
        for u in &utterances {
            first_frames.push(total_frames);
            total_frames += u.num_frames;
        }
        Self {
            utterances,
            total_frames,
            first_frames,
            residency: Residency::default(),
        }
    }

    pub fn utterance_count(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_resident(&self) -> bool {
        self.residency.is_resident()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utt(n: usize) -> Utterance {
        Utterance::new("a.feat".into(), "key".into(), n, 0, false)
    }

    #[test]
    fn prefix_sums_and_total() {
        let chunk = Chunk::from_utterances(vec![utt(3), utt(5), utt(2)]);
        assert_eq!(chunk.first_frames, vec![0, 3, 8]);
        assert_eq!(chunk.total_frames, 10);
    }

    #[test]
    fn residency_toggles() {
        let mut chunk = Chunk::from_utterances(vec![utt(2)]);
        assert!(!chunk.is_resident());
        chunk.residency.frames = Some(vec![0.0; 2]);
        assert!(chunk.is_resident());
        chunk.residency.release();
        assert!(!chunk.is_resident());
    }
}
