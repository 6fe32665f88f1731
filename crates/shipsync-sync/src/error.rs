//! Error types for the sync module.

use thiserror::Error;

/// Errors that can occur while moving messages between nodes.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport-level error (broker unreachable, connection dropped).
    #[error("transport error: {0}")]
    TransportError(String),

    /// Operation attempted without a live connection.
    #[error("transport not connected")]
    NotConnected,

    /// Timeout waiting for the broker.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Message failed validation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Envelope could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] shipsync_core::CoreError),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] shipsync_store::StoreError),

    /// A message handler failed to apply a message.
    #[error("handler error: {0}")]
    Handler(String),
}

impl SyncError {
    /// Whether the error is a transport fault worth retrying after reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::TransportError(_) | SyncError::NotConnected | SyncError::Timeout(_)
        )
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
