//! # convsync
//!
//! An offline-first storage and synchronization engine for chat clients.
//!
//! Conversations, messages and artifacts are written to a durable local
//! store first. Every write is tracked as pending until a remote the
//! application provides acknowledges it; a background coordinator pushes
//! pending records whenever the device is online, backs off on transient
//! failures, and surfaces conflicts instead of overwriting either side.
//!
//! ```rust,ignore
//! use convsync::{Engine, EngineConfig, MockRemote};
//!
//! let engine = Engine::new(EngineConfig::in_memory(), MockRemote::new());
//! engine.initialize().await?;
//! engine.connectivity_signal()?.report(true);
//! ```
//!
//! The building blocks live in their own crates and are re-exported here:
//! [`convsync_core`] (store, ledger, model) and [`convsync_sync_engine`]
//! (connectivity, coordinator, remote seam).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod status;

pub use config::{EngineConfig, StoreLocation};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use status::{ConflictInfo, SyncStatus};

pub use convsync_core::{
    Artifact, ArtifactType, Conversation, Entity, EntityKind, MarkSyncedOutcome, MarkerKind,
    Message, MessageMetadata, MetadataMap, MetadataValue, RecordKey, Role, StoreConfig,
};
pub use convsync_sync_engine::{
    BackoffConfig, ConnectivitySignal, ConnectivityState, CoordinatorState, MockRemote,
    RemoteChanges, RemoteCollaborator, RemoteError, SubmitOutcome, SyncConfig, SyncRecord,
    SyncStats,
};

/// Version of the convsync crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
