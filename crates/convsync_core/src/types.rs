//! Core type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of entity the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityKind {
    /// A conversation, owner of its messages.
    Conversation = 1,
    /// A single user or assistant turn.
    Message = 2,
    /// A standalone artifact (image, document, code, text).
    Artifact = 3,
}

impl EntityKind {
    /// All kinds, in the order they are applied when seeding.
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Conversation,
        EntityKind::Message,
        EntityKind::Artifact,
    ];

    /// Converts a log byte to a kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Conversation),
            2 => Some(Self::Message),
            3 => Some(Self::Artifact),
            _ => None,
        }
    }

    /// Converts the kind to its log byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the lowercase name used in logs and the CLI.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Message => "message",
            Self::Artifact => "artifact",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(Self::Conversation),
            "message" => Ok(Self::Message),
            "artifact" => Ok(Self::Artifact),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Identity of a stored record: its kind plus its id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Entity kind.
    pub kind: EntityKind,
    /// Opaque entity id.
    pub id: String,
}

impl RecordKey {
    /// Creates a record key.
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// The smallest key of `kind`, used as a range start.
    pub(crate) fn first_of(kind: EntityKind) -> Self {
        Self {
            kind,
            id: String::new(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Store-level metadata slots persisted in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MetaKey {
    /// Cursor returned by the remote's change feed.
    ServerCursor = 1,
    /// Unix milliseconds of the last drain cycle that completed cleanly.
    LastFullSync = 2,
}

impl MetaKey {
    /// Converts a log byte to a key.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::ServerCursor),
            2 => Some(Self::LastFullSync),
            _ => None,
        }
    }

    /// Converts the key to its log byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Commit sequence number; higher means later.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_bytes() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(EntityKind::from_byte(0), None);
    }

    #[test]
    fn entity_kind_parse() {
        assert_eq!("message".parse::<EntityKind>(), Ok(EntityKind::Message));
        assert!("thread".parse::<EntityKind>().is_err());
    }

    #[test]
    fn record_keys_order_by_kind_then_id() {
        let c = RecordKey::new(EntityKind::Conversation, "z");
        let m = RecordKey::new(EntityKind::Message, "a");
        assert!(c < m);
        assert!(RecordKey::first_of(EntityKind::Message) <= m);
    }

    #[test]
    fn sequence_number_next() {
        assert_eq!(SequenceNumber::new(5).next().as_u64(), 6);
        assert_eq!(format!("{}", TransactionId::new(3)), "txn:3");
    }
}
