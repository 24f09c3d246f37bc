//! Engine error types.

use convsync_core::{CoreError, RecordKey};
use convsync_sync_engine::SyncError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the [`crate::Engine`].
///
/// Transient sync failures never appear here: the coordinator absorbs them
/// with backoff.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An operation ran before [`crate::Engine::initialize`].
    #[error("engine not initialized")]
    NotInitialized,

    /// The store refused or failed a write. Integrity violations, such as
    /// a message referencing an unknown conversation, land here.
    #[error("storage error: {0}")]
    Storage(CoreError),

    /// The record was never stored.
    #[error("unknown record {0}")]
    UnknownRecord(RecordKey),

    /// The store is damaged; [`crate::Engine::reset`] is required.
    #[error("store corrupted, reset required: {message}")]
    Corrupted {
        /// What was found.
        message: String,
    },

    /// The sync coordinator failed.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// A background task was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl EngineError {
    /// Returns true for integrity violations of the data model.
    pub fn is_integrity(&self) -> bool {
        matches!(self, EngineError::Storage(CoreError::Integrity { .. }))
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnknownRecord(key) => EngineError::UnknownRecord(key),
            err if err.requires_reinitialization() => EngineError::Corrupted {
                message: err.to_string(),
            },
            err => EngineError::Storage(err),
        }
    }
}
