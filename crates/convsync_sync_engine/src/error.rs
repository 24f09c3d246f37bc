//! Error types for the sync engine.

use crate::remote::RemoteError;
use convsync_core::CoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote failed in a way worth retrying.
    #[error("transient sync failure: {0}")]
    Transient(String),

    /// A remote call exceeded its time budget.
    #[error("remote call timed out")]
    Timeout,

    /// The local store failed.
    #[error("store error: {0}")]
    Store(#[from] CoreError),

    /// The operation was dropped before it finished.
    #[error("sync cancelled")]
    Cancelled,

    /// The coordinator has shut down.
    #[error("sync coordinator shut down")]
    Shutdown,
}

impl SyncError {
    /// Returns true if the coordinator should back off and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Timeout)
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transient(message) => SyncError::Transient(message),
            RemoteError::Timeout => SyncError::Timeout,
        }
    }
}
