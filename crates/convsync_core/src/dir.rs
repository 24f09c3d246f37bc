//! Store directory management.
//!
//! ```text
//! <store_path>/
//! ├─ LOCK            # Advisory lock for single-writer
//! ├─ store.log       # Write-ahead log, the only source of truth
//! └─ store.log.tmp   # Compaction output, renamed over store.log
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const LOG_FILE: &str = "store.log";
const COMPACTION_FILE: &str = "store.log.tmp";

/// An exclusively locked store directory.
///
/// The lock is held for the lifetime of the value and released on drop.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens (and optionally creates) a store directory and locks it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidOperation`] if the directory is missing and
    ///   `create_if_missing` is false, or the path is not a directory
    /// - [`CoreError::Locked`] if another process holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// The directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the write-ahead log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.path.join(LOG_FILE)
    }

    /// Path compaction writes to before the rename.
    #[must_use]
    pub fn compaction_path(&self) -> PathBuf {
        self.path.join(COMPACTION_FILE)
    }

    /// Removes a compaction file left behind by a crash mid-compaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists and cannot be removed.
    pub fn remove_stale_compaction(&self) -> CoreResult<bool> {
        let tmp = self.compaction_path();
        if tmp.exists() {
            tracing::warn!(path = %tmp.display(), "removing interrupted compaction output");
            fs::remove_file(&tmp)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Atomically replaces the log with the compaction output.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails.
    pub fn install_compaction(&self) -> CoreResult<()> {
        fs::rename(self.compaction_path(), self.log_path())?;
        self.sync_directory();
        Ok(())
    }

    /// Deletes the log and any compaction output, leaving an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists and cannot be removed.
    pub fn wipe(&self) -> CoreResult<()> {
        for file in [self.log_path(), self.compaction_path()] {
            if file.exists() {
                fs::remove_file(&file)?;
            }
        }
        self.sync_directory();
        Ok(())
    }

    // Directory fsync is not available everywhere; the rename itself is
    // already atomic.
    fn sync_directory(&self) {
        if let Ok(dir) = File::open(&self.path) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("store");

        let dir = StoreDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.log_path(), path.join("store.log"));
    }

    #[test]
    fn open_missing_without_create_fails() {
        let temp = tempdir().unwrap();
        let result = StoreDir::open(&temp.path().join("nope"), false);
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn second_open_is_locked_out() {
        let temp = tempdir().unwrap();
        let _first = StoreDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            StoreDir::open(temp.path(), true),
            Err(CoreError::Locked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(StoreDir::open(temp.path(), true).unwrap());
        StoreDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn install_and_wipe() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true).unwrap();
        fs::write(dir.log_path(), b"old").unwrap();
        fs::write(dir.compaction_path(), b"new").unwrap();

        dir.install_compaction().unwrap();
        assert_eq!(fs::read(dir.log_path()).unwrap(), b"new");
        assert!(!dir.compaction_path().exists());

        fs::write(dir.compaction_path(), b"junk").unwrap();
        assert!(dir.remove_stale_compaction().unwrap());
        dir.wipe().unwrap();
        assert!(!dir.log_path().exists());
    }
}
