//! Decode and configuration error types.

use thiserror::Error;

/// Result type for raw-format operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Per-record decode failure. Recoverable: the record is skipped.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Channel identifier at or above the configured channel limit.
    #[error("channel {channel_id} outside configured range 0..{limit}")]
    ChannelOutOfRange { channel_id: u32, limit: u32 },
}

/// Raw-format error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Record-level decode error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid acquisition configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed JSON configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core library error.
    #[error("core error: {0}")]
    Core(#[from] petstream_core::Error),
}
