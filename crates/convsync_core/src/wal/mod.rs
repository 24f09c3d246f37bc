//! Write-ahead log for the local store.
//!
//! Every store mutation is a transaction written as one contiguous buffer:
//!
//! ```text
//! Begin | Put/Delete/MarkPending/MarkSynced/SetMarker/ClearMarker/SetMeta ... | Commit
//! ```
//!
//! ## Record Format
//!
//! ```text
//! | magic "CSWL" (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! Tolerated (treated as a clean end of log, the tail is truncated away):
//!
//! - a truncated header or payload at the end of the log
//! - a transaction whose `Commit` never made it to disk
//!
//! Neither was ever acknowledged to a caller, so dropping them loses nothing
//! that was promised.
//!
//! Fatal (open fails, the store must be re-initialized):
//!
//! - CRC mismatch, bad magic, unknown record type, future version
//! - a `Commit` whose pending counters disagree with the replayed ledger
//!
//! ## Invariants
//!
//! - the log is append-only outside of rollback and compaction
//! - a commit is flushed before the write is acknowledged
//! - replay applies only committed transactions, in log order

mod iterator;
mod record;
mod writer;

pub use iterator::{LogEntry, WalRecordIterator};
pub use record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::Wal;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

/// Trailing CRC32.
pub(crate) const CRC_SIZE: usize = 4;
