//! Local store configuration.

/// Options for opening a [`crate::LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Create the store directory if it does not exist.
    pub create_if_missing: bool,

    /// `fsync` the log after every commit, not just flush it to the OS.
    pub sync_on_commit: bool,

    /// Compact automatically once the log holds this many bytes more than
    /// the last compaction produced (0 = never).
    pub auto_compact_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            auto_compact_bytes: 0,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to `fsync` on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the auto-compaction threshold in bytes.
    #[must_use]
    pub const fn auto_compact_bytes(mut self, bytes: u64) -> Self {
        self.auto_compact_bytes = bytes;
        self
    }
}
