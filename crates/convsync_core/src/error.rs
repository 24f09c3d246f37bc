//! Error types for the local store.

use crate::types::RecordKey;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the local store and its ledger.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The byte backend failed.
    #[error("storage backend error: {0}")]
    Storage(#[from] convsync_storage::StorageError),

    /// Filesystem error outside the backend (directory, lock file, rename).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An entity could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A write would break referential integrity.
    #[error("integrity violation: {message}")]
    Integrity {
        /// Description of the violation.
        message: String,
    },

    /// The log is corrupted; the store must be re-initialized.
    #[error("store corrupted: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// A log record failed its checksum.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Offset of the failing record.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The ledger was asked about a record it never tracked.
    #[error("unknown record {0}")]
    UnknownRecord(RecordKey),

    /// Another process owns the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// A failed write could not be rolled back; the store must be reopened.
    #[error("store poisoned by an unrecoverable write failure")]
    Poisoned,

    /// The operation is not valid in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an integrity violation.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if the on-disk state cannot be trusted and the store has
    /// to be re-initialized before further use.
    pub fn requires_reinitialization(&self) -> bool {
        matches!(
            self,
            CoreError::Corruption { .. } | CoreError::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityKind;

    #[test]
    fn corruption_requires_reinitialization() {
        assert!(CoreError::corruption("bad magic").requires_reinitialization());
        assert!(CoreError::ChecksumMismatch {
            offset: 0,
            expected: 1,
            actual: 2
        }
        .requires_reinitialization());
        assert!(!CoreError::integrity("dangling").requires_reinitialization());
        assert!(!CoreError::Poisoned.requires_reinitialization());
    }

    #[test]
    fn unknown_record_display() {
        let err = CoreError::UnknownRecord(RecordKey::new(EntityKind::Message, "m-1"));
        assert_eq!(err.to_string(), "unknown record message:m-1");
    }
}
