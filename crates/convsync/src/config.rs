//! Engine configuration.

use convsync_core::StoreConfig;
use convsync_sync_engine::SyncConfig;
use std::path::PathBuf;

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreLocation {
    /// In memory; gone when the engine is dropped.
    #[default]
    InMemory,
    /// In a directory, created if missing.
    Directory(PathBuf),
}

/// Configuration for an [`crate::Engine`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Where the store lives.
    pub location: StoreLocation,
    /// Store options.
    pub store: StoreConfig,
    /// Coordinator and connectivity options.
    pub sync: SyncConfig,
}

impl EngineConfig {
    /// An engine over an in-memory store.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// An engine over a store in `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::Directory(path.into()),
            ..Self::default()
        }
    }

    /// Sets the store options.
    #[must_use]
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the sync options.
    #[must_use]
    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }
}
