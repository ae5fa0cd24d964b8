//! Speaker diarization back-end over x-vector embeddings.
//!
//! Given per-window speaker embeddings of a recording and their timing, the
//! pipeline clusters the windows with NME spectral clustering (which also
//! estimates the speaker count) or calibrated AHC, optionally refines the result with a
//! Variational-Bayes HMM (single-stream, or coupled over two separated
//! channels), and stitches the overlapping sliding-window labels into
//! contiguous RTTM turns.
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use giztoy_diarize::{DiarizeConfig, Diarizer, Recording};
//!
//! let config = DiarizeConfig::load(Path::new("diarize.yaml"))?;
//! let diarizer = Diarizer::new(config, None, None)?;
//! let archive = Recording::load(Path::new("rec.ark"), Path::new("rec.seg"), None)?;
//! for rec in &archive.recordings {
//!     let out = diarizer.diarize(rec)?;
//!     out.write_rttm(std::io::stdout())?;
//! }
//! # Ok::<(), giztoy_diarize::DiarizeError>(())
//! ```
//!
//! # Layout
//!
//! - [`similarity`], [`spectral`], [`kmeans`]: affinity and NME clustering.
//! - [`ahc`]: average-linkage clustering with a calibrated stopping point.
//! - [`vbx`], [`coupled`], [`hmm`], [`init`]: VB-HMM refinement.
//! - [`stitch`]: window labels to turns.
//! - [`der`]: diarization error rate with optimal speaker mapping.
//! - [`io`]: Kaldi archives and segments, RTTM, npz model bundles.

pub mod ahc;
pub mod config;
pub mod coupled;
pub mod der;
mod error;
pub mod hmm;
pub mod init;
pub mod io;
pub mod kmeans;
pub mod linalg;
pub mod pipeline;
pub mod plda;
pub mod sampling;
pub mod similarity;
pub mod spectral;
pub mod stitch;
pub mod transform;
pub mod vbx;

pub use ahc::{ahc, AhcOptions, AhcResult};
pub use config::{CoupledConfig, DiarizeConfig, VbxConfig};
pub use coupled::{coupled_vb_hmm, CoupledOptions, CoupledOutput};
pub use der::{der, hard_labels, xentropy};
pub use error::DiarizeError;
pub use init::InitMode;
pub use pipeline::{
    read_job_list, score_rttm, BatchJob, BatchSummary, Diarization, DiarizationSummary, Diarizer, LoadedArchive,
    Recording, RecordingFailure, ScoreReport,
};
pub use plda::Plda;
pub use similarity::SimilarityKind;
pub use spectral::{nme_spectral_clustering, NmeOptions, SpectralResult};
pub use stitch::{stitch, Labels, Segment, Stitched, Turn, Window};
pub use transform::XvecTransform;
pub use vbx::{vb_hmm, EigenvoiceModel, VbInit, VbOptions, VbOutput, VbTrace};
