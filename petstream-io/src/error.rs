//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data file.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Invalid index file line.
    #[error("invalid index line {line}: {reason}")]
    InvalidIndex { line: usize, reason: String },

    /// Data ended in the middle of a frame.
    #[error("truncated data at byte {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: u64,
        needed: usize,
        available: usize,
    },

    /// Decode error threshold exceeded.
    #[error("{errors} records failed to decode (limit {limit})")]
    TooManyDecodeErrors { errors: u64, limit: u64 },

    /// `process_step` called without an active step.
    #[error("no active step: call next_step() first")]
    NoActiveStep,

    /// Decoder thread pool could not be built.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Raw format error.
    #[error("raw format error: {0}")]
    Raw(#[from] petstream_raw::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] petstream_core::Error),
}
