//! Dump-log command implementation.

use super::LOG_FILE;
use convsync_core::wal::{LogEntry, WalRecord, WalRecordIterator};
use convsync_storage::{FileBackend, StorageBackend};
use serde::Serialize;
use std::path::Path;

/// One log record as printed.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct DumpedRecord {
    /// Offset of the record.
    pub offset: u64,
    /// Framed length.
    pub len: u64,
    /// Record type.
    pub record_type: String,
    /// Owning transaction.
    pub txid: u64,
    /// Affected record, as `kind:id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Type-specific details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&LogEntry> for DumpedRecord {
    fn from(entry: &LogEntry) -> Self {
        let record = &entry.record;
        let detail = match record {
            WalRecord::Put { bytes, .. } => Some(format!("{} bytes", bytes.len())),
            WalRecord::MarkSynced { revision, .. } => Some(format!("revision {revision}")),
            WalRecord::SetMarker { marker, .. } => {
                Some(format!("{:?}: {}", marker.kind, marker.reason))
            }
            WalRecord::SetMeta { key, value, .. } => Some(format!("{key:?} = {value}")),
            WalRecord::RevisionFloor { floor, .. } => Some(format!("revisions above {floor}")),
            WalRecord::Commit {
                sequence, counts, ..
            } => Some(format!(
                "{sequence}, pending {}/{}/{}",
                counts.conversations, counts.messages, counts.artifacts
            )),
            _ => None,
        };
        Self {
            offset: entry.offset,
            len: entry.len,
            record_type: format!("{:?}", record.record_type()),
            txid: record.txid().as_u64(),
            key: record.key().map(ToString::to_string),
            detail,
        }
    }
}

/// Runs the dump-log command.
pub fn run(
    path: &Path,
    limit: Option<usize>,
    offset: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = path.join(LOG_FILE);
    if !log_path.exists() {
        return Err(format!("No log found at {}", log_path.display()).into());
    }

    let backend = FileBackend::open(&log_path)?;
    let (records, error) = collect(&backend, offset, limit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&records)?),
        _ => {
            println!("Log: {} ({} bytes)", log_path.display(), backend.size()?);
            println!();
            for record in &records {
                print!(
                    "{:>10}  {:<12} txn:{:<6}",
                    record.offset, record.record_type, record.txid
                );
                if let Some(key) = &record.key {
                    print!("  {key}");
                }
                if let Some(detail) = &record.detail {
                    print!("  ({detail})");
                }
                println!();
            }
            println!();
            println!("{} record(s)", records.len());
        }
    }

    match error {
        Some(error) => Err(format!("log unreadable past this point: {error}").into()),
        None => Ok(()),
    }
}

/// Reads up to `limit` records from `offset`. A read error stops the dump
/// and is returned next to what was read before it.
pub fn collect(
    backend: &dyn StorageBackend,
    offset: u64,
    limit: Option<usize>,
) -> Result<(Vec<DumpedRecord>, Option<String>), Box<dyn std::error::Error>> {
    let mut records = Vec::new();
    for entry in WalRecordIterator::new(backend, offset)?.take(limit.unwrap_or(usize::MAX)) {
        match entry {
            Ok(entry) => records.push(DumpedRecord::from(&entry)),
            Err(err) => return Ok((records, Some(err.to_string()))),
        }
    }
    Ok((records, None))
}
