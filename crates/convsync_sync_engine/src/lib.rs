//! # convsync sync engine
//!
//! Moves pending records from a [`convsync_core::LocalStore`] to a remote.
//!
//! This crate provides:
//! - the [`ConnectivityMonitor`], a debounced view of platform reachability
//! - the [`SyncCoordinator`], a tokio task cycling through
//!   `Idle → Draining → Backoff`
//! - the [`RemoteCollaborator`] trait the application implements, and a
//!   scriptable [`MockRemote`]
//! - exponential backoff with jitter
//!
//! ## Drain cycle
//!
//! 1. Pull remote changes after the persisted cursor, if the remote offers
//!    them. Remote copies of locally pending records are not applied; they
//!    raise a conflict marker and the local copy wins.
//! 2. Take a snapshot of the pending records. It is the batch boundary:
//!    records that become pending later go to the next cycle.
//! 3. Submit each record with a bounded timeout and record the verdict in
//!    the store, one commit per record.
//!
//! ## Key Invariants
//!
//! - An acknowledgment syncs only the revision it was issued for
//! - Losing connectivity cancels the cycle; nothing unacknowledged is
//!   marked synced
//! - Transient failures are absorbed by backoff and never surface to callers

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connectivity;
mod coordinator;
mod error;
mod remote;

pub use config::{BackoffConfig, SyncConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivitySignal, ConnectivityState};
pub use coordinator::{CoordinatorHandle, CoordinatorState, CycleReport, SyncCoordinator, SyncStats};
pub use error::{SyncError, SyncResult};
pub use remote::{
    MockRemote, RemoteChanges, RemoteCollaborator, RemoteError, SubmitOutcome, SyncRecord,
};
