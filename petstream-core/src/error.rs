//! Error types for petstream-core.

use thiserror::Error;

/// Result type alias for petstream buffer and pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for buffer access and stage ordering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Record index past the committed size of a buffer.
    #[error("index {index} out of range for buffer of size {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// Access to the last record of an empty buffer.
    #[error("buffer {seq_n} is empty")]
    EmptyBuffer { seq_n: u64 },

    /// Second attempt to close the time window of a buffer.
    #[error("t_max of buffer {seq_n} already set to {t_max}")]
    TMaxAlreadySet { seq_n: u64, t_max: i64 },

    /// Buffer delivered to an overlapped stage out of sequence order.
    #[error("buffer {got} delivered out of order (expected {expected})")]
    OutOfOrder { expected: u64, got: u64 },

    /// Sequence number already delivered to a reordering sink.
    #[error("duplicate buffer sequence number {0}")]
    DuplicateSequence(u64),
}
