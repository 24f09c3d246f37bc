//! CLI command implementations.

pub mod compact;
pub mod dump_log;
pub mod inspect;
pub mod verify;

use convsync_core::{CoreResult, LocalStore, StoreConfig};
use std::path::Path;

/// Name of the log inside a store directory.
pub const LOG_FILE: &str = "store.log";

/// Opens an existing store; never creates one.
pub fn open_existing(path: &Path) -> CoreResult<LocalStore> {
    LocalStore::open(path, StoreConfig::new().create_if_missing(false))
}
