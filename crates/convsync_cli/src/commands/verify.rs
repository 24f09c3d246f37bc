//! Verify command implementation.

use super::{open_existing, LOG_FILE};
use convsync_core::wal::{WalRecord, WalRecordIterator};
use convsync_storage::{FileBackend, StorageBackend};
use std::path::Path;

/// Outcome of scanning the log.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LogScan {
    /// Records read.
    pub records: usize,
    /// Committed transactions.
    pub transactions: usize,
    /// Bytes covered by committed transactions.
    pub committed_bytes: u64,
    /// Bytes past the last commit; discarded on the next open.
    pub discarded_bytes: u64,
    /// Problems found; empty if the log is sound.
    pub errors: Vec<String>,
}

impl LogScan {
    /// Returns true if no problems were found.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path, log_only: bool) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = path.join(LOG_FILE);
    if !log_path.exists() {
        return Err(format!("No store found at {}", path.display()).into());
    }

    println!("Verifying store at {}", path.display());
    let backend = FileBackend::open(&log_path)?;
    let scan = scan_log(&backend)?;
    drop(backend);

    println!("  Records:       {}", scan.records);
    println!("  Transactions:  {}", scan.transactions);
    println!("  Committed:     {} bytes", scan.committed_bytes);
    if scan.discarded_bytes > 0 {
        println!(
            "  Torn tail:     {} bytes (an unfinished write; dropped on next open)",
            scan.discarded_bytes
        );
    }

    let mut errors = scan.errors;
    if errors.is_empty() && !log_only {
        tracing::debug!("log framing valid; checking store invariants");
        match open_existing(path).and_then(|store| store.verify()) {
            Ok(()) => println!("  Invariants:    ok"),
            Err(err) => errors.push(format!("store check failed: {err}")),
        }
    }

    if errors.is_empty() {
        println!("Store is valid.");
        Ok(())
    } else {
        for error in &errors {
            println!("  ERROR: {error}");
        }
        Err(format!("{} problem(s) found", errors.len()).into())
    }
}

/// Scans the log frame by frame without changing it.
pub fn scan_log(backend: &dyn StorageBackend) -> Result<LogScan, Box<dyn std::error::Error>> {
    let mut scan = LogScan::default();
    let mut open_txn = None;

    for entry in WalRecordIterator::new(backend, 0)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                scan.errors.push(err.to_string());
                break;
            }
        };
        scan.records += 1;

        match (&entry.record, open_txn) {
            (WalRecord::Begin { txid }, None) => open_txn = Some(*txid),
            (WalRecord::Begin { txid }, Some(open)) => {
                scan.errors.push(format!(
                    "{txid} begins at offset {} while {open} is still open",
                    entry.offset
                ));
                break;
            }
            (WalRecord::Commit { txid, .. }, Some(open)) if *txid == open => {
                open_txn = None;
                scan.transactions += 1;
                scan.committed_bytes = entry.end();
            }
            (record, Some(open)) if record.txid() == open => {}
            (record, _) => {
                scan.errors.push(format!(
                    "{:?} record of {} at offset {} is outside its transaction",
                    record.record_type(),
                    record.txid(),
                    entry.offset
                ));
                break;
            }
        }
    }

    scan.discarded_bytes = backend.size()?.saturating_sub(scan.committed_bytes);
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use convsync_storage::InMemoryBackend;
    use convsync_testkit::{seed_conversation, TestStore};

    #[test]
    fn clean_log() {
        let store = TestStore::memory();
        seed_conversation(&store, "c1", 3);
        let backend = InMemoryBackend::with_data(store.raw_log());

        let scan = scan_log(&backend).unwrap();
        assert!(scan.is_valid());
        assert_eq!(scan.transactions, 4);
        assert_eq!(scan.discarded_bytes, 0);
    }

    #[test]
    fn torn_tail_is_reported_not_fatal() {
        let store = TestStore::memory();
        seed_conversation(&store, "c1", 1);
        let mut bytes = store.raw_log();
        bytes.truncate(bytes.len() - 3);
        let backend = InMemoryBackend::with_data(bytes);

        let scan = scan_log(&backend).unwrap();
        assert!(scan.is_valid());
        assert_eq!(scan.transactions, 1);
        assert!(scan.discarded_bytes > 0);
    }

    #[test]
    fn flipped_byte_is_an_error() {
        let store = TestStore::memory();
        seed_conversation(&store, "c1", 1);
        let mut bytes = store.raw_log();
        bytes[13] ^= 0xFF;
        let backend = InMemoryBackend::with_data(bytes);

        let scan = scan_log(&backend).unwrap();
        assert!(!scan.is_valid());
        assert_eq!(scan.transactions, 0);
    }
}
