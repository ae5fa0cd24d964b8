//! File formats: Kaldi archives and segments, RTTM, NumPy `.npz` bundles.

pub mod ark;
pub mod npz;
pub mod rttm;
pub mod timing;

pub use ark::{group_by_recording, read_ark, write_ark_binary, write_ark_text, ArkEntry, EmbeddingName};
pub use rttm::{overlap_intervals, overlap_vector, read_rttm, write_rttm, RttmRecord};
pub use timing::{by_recording, read_segments, SegmentTiming};
