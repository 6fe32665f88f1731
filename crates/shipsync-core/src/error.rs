//! Error types for shipsync core.

use thiserror::Error;

/// Errors raised while encoding, decoding or validating messages.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
