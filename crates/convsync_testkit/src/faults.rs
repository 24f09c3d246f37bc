//! A backend that fails on command.
//!
//! Wraps an [`InMemoryBackend`] and injects failures into `append`, `flush`
//! and `truncate`. Clones share both the bytes and the fault switches, so a
//! test keeps one clone to flip faults while the store owns another.
//!
//! ```rust
//! use convsync_core::{LocalStore, StoreConfig};
//! use convsync_testkit::{sample_conversation, FaultyBackend};
//!
//! let backend = FaultyBackend::new();
//! let store = LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default()).unwrap();
//!
//! backend.fail_appends(true);
//! assert!(store.put(sample_conversation("c1")).is_err());
//! assert!(store.get_conversation("c1").is_none());
//! ```

use convsync_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Switches {
    fail_appends: AtomicBool,
    fail_flush: AtomicBool,
    fail_truncate: AtomicBool,
    // bytes + 1 to keep from the next append; 0 = disarmed
    tear_next_append: AtomicUsize,
    appends: AtomicUsize,
}

/// A fault-injecting log backend.
#[derive(Debug, Clone, Default)]
pub struct FaultyBackend {
    inner: InMemoryBackend,
    switches: Arc<Switches>,
}

impl FaultyBackend {
    /// An empty, healthy backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every append fail without writing anything.
    pub fn fail_appends(&self, on: bool) {
        self.switches.fail_appends.store(on, Ordering::SeqCst);
    }

    /// Makes every flush fail after the append went through.
    pub fn fail_flush(&self, on: bool) {
        self.switches.fail_flush.store(on, Ordering::SeqCst);
    }

    /// Makes rollback truncation fail.
    pub fn fail_truncate(&self, on: bool) {
        self.switches.fail_truncate.store(on, Ordering::SeqCst);
    }

    /// The next append writes only its first `keep` bytes, then fails, as if
    /// the process died mid-write.
    pub fn tear_next_append(&self, keep: usize) {
        self.switches
            .tear_next_append
            .store(keep + 1, Ordering::SeqCst);
    }

    /// Clears every fault.
    pub fn heal(&self) {
        self.fail_appends(false);
        self.fail_flush(false);
        self.fail_truncate(false);
        self.switches.tear_next_append.store(0, Ordering::SeqCst);
    }

    /// Appends attempted so far, failed ones included.
    pub fn append_count(&self) -> usize {
        self.switches.appends.load(Ordering::SeqCst)
    }

    /// A healthy in-memory backend sharing these bytes, to reopen a store
    /// on what survived.
    pub fn survivor(&self) -> InMemoryBackend {
        self.inner.clone()
    }

    /// Copy of the log bytes.
    pub fn data(&self) -> Vec<u8> {
        self.inner.data()
    }
}

fn injected(what: &str) -> StorageError {
    StorageError::Unavailable(format!("injected {what} failure"))
}

impl StorageBackend for FaultyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.switches.appends.fetch_add(1, Ordering::SeqCst);
        if self.switches.fail_appends.load(Ordering::SeqCst) {
            return Err(injected("append"));
        }
        let tear = self.switches.tear_next_append.swap(0, Ordering::SeqCst);
        if tear > 0 {
            let keep = (tear - 1).min(data.len());
            self.inner.append(&data[..keep])?;
            return Err(injected("torn append"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.switches.fail_flush.load(Ordering::SeqCst) {
            return Err(injected("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.switches.fail_flush.load(Ordering::SeqCst) {
            return Err(injected("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if self.switches.fail_truncate.load(Ordering::SeqCst) {
            return Err(injected("truncate"));
        }
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn torn_append_keeps_prefix() {
        let mut backend = FaultyBackend::new();
        backend.tear_next_append(2);
        assert!(backend.append(b"abcdef").is_err());
        assert_eq!(backend.data(), b"ab");

        // One-shot
        backend.append(b"cd").unwrap();
        assert_eq!(backend.data(), b"abcd");
        assert_eq!(backend.append_count(), 2);
    }

    #[test]
    fn heal_clears_faults() {
        let mut backend = FaultyBackend::new();
        backend.fail_appends(true);
        backend.fail_truncate(true);
        assert!(backend.append(b"x").is_err());
        assert!(backend.truncate(0).is_err());

        backend.heal();
        backend.append(b"x").unwrap();
        backend.truncate(0).unwrap();
    }
}
