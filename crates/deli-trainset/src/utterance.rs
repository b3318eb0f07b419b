/// Reserved class id marking an utterance boundary in the flat label array.
pub const SENTINEL: i32 = -1;

/// Immutable per-utterance metadata. Frames themselves live only inside a
/// resident [`crate::chunk::Chunk`]'s frame matrix; an utterance never owns
/// frame data directly.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub archive_path: String,
    pub key: String,
    pub num_frames: usize,
    /// Index into the corpus-wide flat label array. `labels[label_offset]`
    /// is the first frame's label, `labels[label_offset + num_frames - 1]`
    /// the last, and `labels[label_offset + num_frames] == SENTINEL`.
    pub label_offset: usize,
    pub has_lattice: bool,
}

impl Utterance {
    pub fn new(archive_path: String, key: String, num_frames: usize, label_offset: usize, has_lattice: bool) -> Self {
        Self {
            archive_path,
            key,
            num_frames,
            label_offset,
            has_lattice,
        }
    }
}
