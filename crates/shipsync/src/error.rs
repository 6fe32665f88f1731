//! Error types for the sync engine.

use shipsync_core::CoreError;
use shipsync_store::StoreError;
use shipsync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Transport or dispatch error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Message encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] CoreError),

    /// The host content store rejected an operation.
    #[error("content store error: {0:#}")]
    Content(anyhow::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A record the operation needs does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not valid in the current state or role.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl EngineError {
    /// Whether the failure was the broker being unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(self, EngineError::Sync(e) if e.is_transport())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Content(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Codec(CoreError::Encoding(e.to_string()))
    }
}

/// Handler failures surface to the dispatcher, which dead-letters the message.
impl From<EngineError> for SyncError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Sync(inner) => inner,
            EngineError::Store(inner) => SyncError::StoreError(inner),
            other => SyncError::Handler(other.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
