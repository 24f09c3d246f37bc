//! # convsync core
//!
//! The local data layer of the convsync offline-first engine.
//!
//! This crate provides:
//! - the data model (conversations, messages, artifacts, schema-less metadata)
//! - a write-ahead log of CRC-framed records for durability
//! - the [`LocalStore`], a keyed store rebuilt from the log on open
//! - the [`SyncLedger`], the per-record pending/synced classification with
//!   O(1) pending counters
//!
//! ## Key Invariants
//!
//! - A write that returns `Ok` is flushed to the backend
//! - Multi-record mutations are a single transaction: all or nothing
//! - Ledger counters change only while a committed transaction is applied,
//!   and every commit record carries the counters it produced
//! - A message always references an existing conversation

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod dir;
mod error;
mod ledger;
pub mod model;
mod state;
mod store;
mod types;
pub mod wal;

pub use codec::{content_digest, decode_entity, encode_entity};
pub use config::StoreConfig;
pub use dir::StoreDir;
pub use error::{CoreError, CoreResult};
pub use ledger::{
    LedgerEntry, MarkSyncedOutcome, MarkerKind, PendingCounts, PendingRecord, SyncLedger,
    SyncMarker,
};
pub use model::{
    Artifact, ArtifactType, Conversation, Entity, Message, MessageMetadata, MetadataMap,
    MetadataValue, Role,
};
pub use store::{
    CompactionReport, ConversationMessages, LocalStore, RemoteApply, StoreStats, Transaction,
};
pub use types::{EntityKind, MetaKey, RecordKey, SequenceNumber, TransactionId};

/// Version of the convsync core crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
