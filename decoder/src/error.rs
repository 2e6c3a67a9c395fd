use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by [`crate::OpusDecoder`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("source not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error("track has not been decoded")]
    NotDecoded,
}

pub type Result<T> = std::result::Result<T, DecodeError>;
