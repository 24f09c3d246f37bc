//! Streaming WAL record iterator.

use super::record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use super::{CRC_SIZE, HEADER_SIZE};
use crate::error::{CoreError, CoreResult};
use convsync_storage::StorageBackend;

/// A decoded record and where it sits in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Offset of the record's first byte.
    pub offset: u64,
    /// Framed length in bytes, header and CRC included.
    pub len: u64,
    /// The record.
    pub record: WalRecord,
}

impl LogEntry {
    /// Offset just past this record.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Reads records one at a time straight from the backend.
///
/// - a truncated header or payload at the tail ends iteration cleanly
/// - CRC mismatch, bad magic, unknown type or a future version yield an
///   error and end iteration
pub struct WalRecordIterator<'a> {
    backend: &'a dyn StorageBackend,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: &'a dyn StorageBackend, start_offset: u64) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset: start_offset,
            finished: false,
        })
    }

    /// Offset the next record would be read from.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<LogEntry>> {
        let remaining = self.total_size.saturating_sub(self.offset);
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header = self.backend.read_at(self.offset, HEADER_SIZE)?;
        if header[0..4] != WAL_MAGIC {
            return Err(CoreError::corruption(format!(
                "invalid record magic at offset {}",
                self.offset
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            return Err(CoreError::corruption(format!(
                "unsupported log version {version} at offset {}",
                self.offset
            )));
        }

        let type_byte = header[6];
        let record_type = WalRecordType::from_byte(type_byte).ok_or_else(|| {
            CoreError::corruption(format!(
                "unknown record type {type_byte} at offset {}",
                self.offset
            ))
        })?;

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as u64;
        let framed_len = HEADER_SIZE as u64 + payload_len + CRC_SIZE as u64;
        if remaining < framed_len {
            // Torn tail: the write never completed
            return Ok(None);
        }

        let body = self.backend.read_at(
            self.offset + HEADER_SIZE as u64,
            payload_len as usize + CRC_SIZE,
        )?;
        let (payload, crc_bytes) = body.split_at(payload_len as usize);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut covered = header;
        covered.extend_from_slice(payload);
        let actual = compute_crc32(&covered);
        if actual != expected {
            return Err(CoreError::ChecksumMismatch {
                offset: self.offset,
                expected,
                actual,
            });
        }

        let record = WalRecord::decode_payload(record_type, payload)?;
        let entry = LogEntry {
            offset: self.offset,
            len: framed_len,
            record,
        };
        self.offset += framed_len;
        Ok(Some(entry))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use crate::wal::Wal;
    use convsync_storage::InMemoryBackend;

    fn begin(txid: u64) -> WalRecord {
        WalRecord::Begin {
            txid: TransactionId::new(txid),
        }
    }

    fn log_of(records: &[WalRecord]) -> InMemoryBackend {
        let mut buf = Vec::new();
        for record in records {
            Wal::encode_into(record, &mut buf).unwrap();
        }
        InMemoryBackend::with_data(buf)
    }

    #[test]
    fn empty_log_yields_nothing() {
        let backend = InMemoryBackend::new();
        assert_eq!(WalRecordIterator::new(&backend, 0).unwrap().count(), 0);
    }

    #[test]
    fn offsets_chain() {
        let backend = log_of(&[begin(1), begin(2)]);
        let entries: Vec<_> = WalRecordIterator::new(&backend, 0)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[1].offset, entries[0].end());
        assert_eq!(entries[1].end(), backend.size().unwrap());
    }

    #[test]
    fn torn_tail_ends_cleanly() {
        let backend = log_of(&[begin(1), begin(2)]);
        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - 3);
        let torn = InMemoryBackend::with_data(bytes);

        let entries: Vec<_> = WalRecordIterator::new(&torn, 0)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn flipped_payload_byte_is_checksum_error() {
        let backend = log_of(&[begin(1)]);
        backend.corrupt_byte(HEADER_SIZE + 2);

        let mut iter = WalRecordIterator::new(&backend, 0).unwrap();
        assert!(matches!(
            iter.next(),
            Some(Err(CoreError::ChecksumMismatch { offset: 0, .. }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let backend = log_of(&[begin(1)]);
        backend.corrupt_byte(0);

        let mut iter = WalRecordIterator::new(&backend, 0).unwrap();
        assert!(matches!(iter.next(), Some(Err(CoreError::Corruption { .. }))));
    }
}
