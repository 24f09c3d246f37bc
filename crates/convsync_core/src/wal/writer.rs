//! WAL writer.

use super::iterator::WalRecordIterator;
use super::record::{compute_crc32, WalRecord, WAL_MAGIC, WAL_VERSION};
use super::{CRC_SIZE, HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use convsync_storage::StorageBackend;

/// Owns the log backend and frames records onto it.
///
/// Callers serialize access (the store keeps the `Wal` behind a mutex), so
/// the writer itself holds no lock.
pub struct Wal {
    backend: Box<dyn StorageBackend>,
    sync_on_commit: bool,
}

impl Wal {
    /// Wraps a backend.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend,
            sync_on_commit,
        }
    }

    /// Frames one record into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the 4 GiB length field.
    pub fn encode_into(record: &WalRecord, buf: &mut Vec<u8>) -> CoreResult<()> {
        let payload = record.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("WAL record payload too large"))?;

        let start = buf.len();
        buf.reserve(HEADER_SIZE + payload.len() + CRC_SIZE);
        buf.extend_from_slice(&WAL_MAGIC);
        buf.extend_from_slice(&WAL_VERSION.to_le_bytes());
        buf.push(record.record_type().as_byte());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC covers header and payload
        let crc = compute_crc32(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Appends a batch of records as one write and makes it durable.
    ///
    /// Returns the offset of the first record. If the append or flush fails,
    /// the log is truncated back to where it was so a partially written
    /// batch never survives to be replayed.
    ///
    /// # Errors
    ///
    /// Returns the underlying write error. Returns [`CoreError::Poisoned`]
    /// if the rollback truncate fails too, since the log tail is then
    /// unknown.
    pub fn append_batch(&mut self, records: &[WalRecord]) -> CoreResult<u64> {
        let mut buf = Vec::new();
        for record in records {
            Self::encode_into(record, &mut buf)?;
        }

        let start = self.backend.size()?;
        match self.write_durably(&buf) {
            Ok(offset) => Ok(offset),
            Err(err) => {
                if let Err(rollback) = self.backend.truncate(start) {
                    tracing::error!(
                        error = %err,
                        rollback_error = %rollback,
                        offset = start,
                        "log rollback failed"
                    );
                    return Err(CoreError::Poisoned);
                }
                tracing::warn!(error = %err, offset = start, "log append rolled back");
                Err(err)
            }
        }
    }

    fn write_durably(&mut self, buf: &[u8]) -> CoreResult<u64> {
        let offset = self.backend.append(buf)?;
        self.backend.flush()?;
        if self.sync_on_commit {
            self.backend.sync()?;
        }
        Ok(offset)
    }

    /// Discards everything and writes `records` as the whole log.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncate or the append fails.
    pub fn rewrite(&mut self, records: &[WalRecord]) -> CoreResult<()> {
        self.backend.truncate(0)?;
        self.append_batch(records)?;
        Ok(())
    }

    /// Swaps in a new backend, for example after a compacted log replaced
    /// the file on disk.
    pub fn replace_backend(&mut self, backend: Box<dyn StorageBackend>) {
        self.backend = backend;
    }

    /// Truncates the log to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the truncate.
    pub fn truncate(&mut self, len: u64) -> CoreResult<()> {
        self.backend.truncate(len)?;
        self.backend.flush()?;
        Ok(())
    }

    /// Returns the log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.size()?)
    }

    /// Returns a streaming iterator over the log, from the start.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn iter(&self) -> CoreResult<WalRecordIterator<'_>> {
        WalRecordIterator::new(self.backend.as_ref(), 0)
    }
}
