//! Derived sync status.

use chrono::{DateTime, Utc};
use convsync_core::{MarkerKind, RecordKey, SyncMarker};
use convsync_sync_engine::CoordinatorState;

/// A record the remote would not take as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictInfo {
    /// The record.
    pub key: RecordKey,
    /// [`MarkerKind::Conflict`] or [`MarkerKind::Rejected`].
    pub kind: MarkerKind,
    /// Reason given by the remote.
    pub reason: String,
    /// When it was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    pub(crate) fn from_marker(key: RecordKey, marker: SyncMarker) -> Option<Self> {
        marker.kind.holds_back().then(|| Self {
            key,
            kind: marker.kind,
            reason: marker.reason,
            detected_at: marker.detected_at,
        })
    }
}

/// A point-in-time view of synchronization. Computed on request, never
/// stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    /// End of the last drain cycle that completed without a transient
    /// failure.
    pub last_full_sync: Option<DateTime<Utc>>,
    /// Messages not yet acknowledged.
    pub pending_messages: u64,
    /// Conversations not yet acknowledged.
    pub pending_conversations: u64,
    /// Artifacts not yet acknowledged.
    pub pending_artifacts: u64,
    /// Debounced connectivity.
    pub is_online: bool,
    /// A drain cycle is running.
    pub is_syncing: bool,
    /// The coordinator's state.
    pub coordinator_state: CoordinatorState,
    /// Records held back by a conflict or rejection.
    pub conflicts: Vec<ConflictInfo>,
}

impl SyncStatus {
    /// All pending records.
    pub fn pending_total(&self) -> u64 {
        self.pending_messages + self.pending_conversations + self.pending_artifacts
    }

    /// Returns true if nothing is pending.
    pub fn is_settled(&self) -> bool {
        self.pending_total() == 0
    }
}
