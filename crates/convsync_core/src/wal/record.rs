//! WAL record types and payload encoding.

use crate::error::{CoreError, CoreResult};
use crate::ledger::{MarkerKind, PendingCounts, SyncMarker};
use crate::types::{EntityKind, MetaKey, RecordKey, SequenceNumber, TransactionId};
use chrono::DateTime;

/// Magic bytes opening every record.
pub const WAL_MAGIC: [u8; 4] = *b"CSWL";

/// Current record format version.
pub const WAL_VERSION: u16 = 1;

/// Type byte of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Opens a transaction.
    Begin = 1,
    /// Inserts or replaces an entity.
    Put = 2,
    /// Removes an entity.
    Delete = 3,
    /// Flags a record as pending.
    MarkPending = 4,
    /// Flags a record revision as acknowledged.
    MarkSynced = 5,
    /// Attaches a conflict/rejection/resolution marker.
    SetMarker = 6,
    /// Removes a marker.
    ClearMarker = 7,
    /// Sets a store metadata slot.
    SetMeta = 8,
    /// Closes a transaction.
    Commit = 9,
    /// Raises the store-wide revision counter.
    RevisionFloor = 10,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Put),
            3 => Some(Self::Delete),
            4 => Some(Self::MarkPending),
            5 => Some(Self::MarkSynced),
            6 => Some(Self::SetMarker),
            7 => Some(Self::ClearMarker),
            8 => Some(Self::SetMeta),
            9 => Some(Self::Commit),
            10 => Some(Self::RevisionFloor),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Opens a transaction.
    Begin {
        /// Transaction ID.
        txid: TransactionId,
    },

    /// Inserts or replaces an entity.
    Put {
        /// Transaction ID.
        txid: TransactionId,
        /// Record written.
        key: RecordKey,
        /// CBOR entity payload.
        bytes: Vec<u8>,
    },

    /// Removes an entity and its ledger entry.
    Delete {
        /// Transaction ID.
        txid: TransactionId,
        /// Record removed.
        key: RecordKey,
    },

    /// Flags a record as pending.
    MarkPending {
        /// Transaction ID.
        txid: TransactionId,
        /// Record flagged.
        key: RecordKey,
    },

    /// Flags a record as synced if its revision still matches.
    MarkSynced {
        /// Transaction ID.
        txid: TransactionId,
        /// Record flagged.
        key: RecordKey,
        /// Revision the remote acknowledged.
        revision: u64,
    },

    /// Attaches a marker to a record.
    SetMarker {
        /// Transaction ID.
        txid: TransactionId,
        /// Record marked.
        key: RecordKey,
        /// The marker.
        marker: SyncMarker,
    },

    /// Removes a record's marker.
    ClearMarker {
        /// Transaction ID.
        txid: TransactionId,
        /// Record unmarked.
        key: RecordKey,
    },

    /// Sets a metadata slot.
    SetMeta {
        /// Transaction ID.
        txid: TransactionId,
        /// Slot.
        key: MetaKey,
        /// Value.
        value: i64,
    },

    /// Closes a transaction.
    Commit {
        /// Transaction ID.
        txid: TransactionId,
        /// Sequence number assigned to this commit.
        sequence: SequenceNumber,
        /// Ledger counters after applying the transaction.
        counts: PendingCounts,
    },

    /// Raises the revision counter so later writes get larger revisions.
    /// Opens a compaction snapshot.
    RevisionFloor {
        /// Transaction ID.
        txid: TransactionId,
        /// Highest revision handed out before the snapshot.
        floor: u64,
    },
}

impl WalRecord {
    /// Maximum entity payload size; the length field is 4 bytes.
    pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Begin { .. } => WalRecordType::Begin,
            Self::Put { .. } => WalRecordType::Put,
            Self::Delete { .. } => WalRecordType::Delete,
            Self::MarkPending { .. } => WalRecordType::MarkPending,
            Self::MarkSynced { .. } => WalRecordType::MarkSynced,
            Self::SetMarker { .. } => WalRecordType::SetMarker,
            Self::ClearMarker { .. } => WalRecordType::ClearMarker,
            Self::SetMeta { .. } => WalRecordType::SetMeta,
            Self::Commit { .. } => WalRecordType::Commit,
            Self::RevisionFloor { .. } => WalRecordType::RevisionFloor,
        }
    }

    /// Returns the transaction the record belongs to.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        match self {
            Self::Begin { txid }
            | Self::Put { txid, .. }
            | Self::Delete { txid, .. }
            | Self::MarkPending { txid, .. }
            | Self::MarkSynced { txid, .. }
            | Self::SetMarker { txid, .. }
            | Self::ClearMarker { txid, .. }
            | Self::SetMeta { txid, .. }
            | Self::Commit { txid, .. }
            | Self::RevisionFloor { txid, .. } => *txid,
        }
    }

    /// Returns the record key, for records that touch a single record.
    #[must_use]
    pub fn key(&self) -> Option<&RecordKey> {
        match self {
            Self::Put { key, .. }
            | Self::Delete { key, .. }
            | Self::MarkPending { key, .. }
            | Self::MarkSynced { key, .. }
            | Self::SetMarker { key, .. }
            | Self::ClearMarker { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Serializes the payload (without framing).
    ///
    /// # Errors
    ///
    /// Returns an error if a `Put` payload exceeds [`Self::MAX_PAYLOAD_SIZE`].
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.txid().as_u64().to_le_bytes());

        match self {
            Self::Begin { .. } => {}
            Self::Put { key, bytes, .. } => {
                if bytes.len() > Self::MAX_PAYLOAD_SIZE {
                    return Err(CoreError::invalid_operation(format!(
                        "entity payload too large: {} bytes",
                        bytes.len()
                    )));
                }
                put_key(&mut buf, key)?;
                put_bytes(&mut buf, bytes)?;
            }
            Self::Delete { key, .. } | Self::MarkPending { key, .. } | Self::ClearMarker { key, .. } => {
                put_key(&mut buf, key)?;
            }
            Self::MarkSynced { key, revision, .. } => {
                put_key(&mut buf, key)?;
                buf.extend_from_slice(&revision.to_le_bytes());
            }
            Self::SetMarker { key, marker, .. } => {
                put_key(&mut buf, key)?;
                buf.push(marker.kind.as_byte());
                buf.extend_from_slice(&marker.detected_at.timestamp_millis().to_le_bytes());
                put_bytes(&mut buf, marker.reason.as_bytes())?;
            }
            Self::SetMeta { key, value, .. } => {
                buf.push(key.as_byte());
                buf.extend_from_slice(&value.to_le_bytes());
            }
            Self::Commit {
                sequence, counts, ..
            } => {
                buf.extend_from_slice(&sequence.as_u64().to_le_bytes());
                buf.extend_from_slice(&counts.conversations.to_le_bytes());
                buf.extend_from_slice(&counts.messages.to_le_bytes());
                buf.extend_from_slice(&counts.artifacts.to_le_bytes());
            }
            Self::RevisionFloor { floor, .. } => {
                buf.extend_from_slice(&floor.to_le_bytes());
            }
        }

        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] on malformed or trailing bytes.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader::new(payload);
        let txid = TransactionId::new(reader.u64()?);

        let record = match record_type {
            WalRecordType::Begin => Self::Begin { txid },
            WalRecordType::Put => {
                let key = reader.key()?;
                let bytes = reader.bytes()?.to_vec();
                Self::Put { txid, key, bytes }
            }
            WalRecordType::Delete => Self::Delete {
                txid,
                key: reader.key()?,
            },
            WalRecordType::MarkPending => Self::MarkPending {
                txid,
                key: reader.key()?,
            },
            WalRecordType::MarkSynced => {
                let key = reader.key()?;
                let revision = reader.u64()?;
                Self::MarkSynced {
                    txid,
                    key,
                    revision,
                }
            }
            WalRecordType::SetMarker => {
                let key = reader.key()?;
                let kind = MarkerKind::from_byte(reader.u8()?)
                    .ok_or_else(|| CoreError::corruption("unknown marker kind"))?;
                let millis = reader.i64()?;
                let detected_at = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| CoreError::corruption("marker timestamp out of range"))?;
                let reason = reader.text()?;
                Self::SetMarker {
                    txid,
                    key,
                    marker: SyncMarker {
                        kind,
                        reason,
                        detected_at,
                    },
                }
            }
            WalRecordType::ClearMarker => Self::ClearMarker {
                txid,
                key: reader.key()?,
            },
            WalRecordType::SetMeta => {
                let key = MetaKey::from_byte(reader.u8()?)
                    .ok_or_else(|| CoreError::corruption("unknown metadata slot"))?;
                let value = reader.i64()?;
                Self::SetMeta { txid, key, value }
            }
            WalRecordType::Commit => {
                let sequence = SequenceNumber::new(reader.u64()?);
                let counts = PendingCounts {
                    conversations: reader.u64()?,
                    messages: reader.u64()?,
                    artifacts: reader.u64()?,
                };
                Self::Commit {
                    txid,
                    sequence,
                    counts,
                }
            }
            WalRecordType::RevisionFloor => Self::RevisionFloor {
                txid,
                floor: reader.u64()?,
            },
        };

        reader.finish(record_type)?;
        Ok(record)
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CoreError::invalid_operation("field too large for a log record"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_key(buf: &mut Vec<u8>, key: &RecordKey) -> CoreResult<()> {
    buf.push(key.kind.as_byte());
    put_bytes(buf, key.id.as_bytes())
}

/// Bounds-checked cursor over a record payload.
struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.payload.len())
            .ok_or_else(|| CoreError::corruption("unexpected end of payload"))?;
        let slice = &self.payload[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| CoreError::corruption("invalid u32"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| CoreError::corruption("invalid u64"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn i64(&mut self) -> CoreResult<i64> {
        Ok(self.u64()? as i64)
    }

    fn bytes(&mut self) -> CoreResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn text(&mut self) -> CoreResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CoreError::corruption("invalid UTF-8 in record"))
    }

    fn key(&mut self) -> CoreResult<RecordKey> {
        let kind = EntityKind::from_byte(self.u8()?)
            .ok_or_else(|| CoreError::corruption("unknown entity kind"))?;
        let id = self.text()?;
        Ok(RecordKey { kind, id })
    }

    fn finish(&self, record_type: WalRecordType) -> CoreResult<()> {
        if self.cursor != self.payload.len() {
            return Err(CoreError::corruption(format!(
                "trailing bytes in {record_type:?} record: expected {} bytes, got {}",
                self.cursor,
                self.payload.len()
            )));
        }
        Ok(())
    }
}

/// Computes the CRC32 (IEEE) checksum of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
