use thiserror::Error;

/// Errors returned by diarization operations.
#[derive(Debug, Error)]
pub enum DiarizeError {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("recording {recording}: embedding names do not match timing: {detail}")]
    NameMismatch { recording: String, detail: String },

    #[error("parse error in {source_name} line {line}: {msg}")]
    Parse {
        source_name: String,
        line: usize,
        msg: String,
    },

    #[error("invalid archive: {0}")]
    Archive(String),

    #[error("npz: {0}")]
    Npz(String),

    #[error("unsupported stream count {0}: only 2 coupled streams are implemented")]
    UnsupportedStreams(usize),

    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
