//! The sync ledger: which records the remote has not acknowledged yet.
//!
//! Every tracked record has a [`LedgerEntry`] carrying a revision (taken
//! from a store-wide counter on every local write) and its pending/synced
//! flag. Pending records are also
//! queued by the order they became pending, which is the order the
//! coordinator submits them in. Counters per kind are kept alongside so
//! status reads never scan.
//!
//! The ledger is only mutated by [`crate::LocalStore`] while it applies a
//! transaction, so it can never disagree with the entities it describes.

use crate::types::{EntityKind, RecordKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

/// Pending record counts per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PendingCounts {
    /// Pending conversations.
    pub conversations: u64,
    /// Pending messages.
    pub messages: u64,
    /// Pending artifacts.
    pub artifacts: u64,
}

impl PendingCounts {
    /// Count for one kind.
    #[must_use]
    pub fn get(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::Conversation => self.conversations,
            EntityKind::Message => self.messages,
            EntityKind::Artifact => self.artifacts,
        }
    }

    /// Sum over all kinds.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.conversations + self.messages + self.artifacts
    }

    fn slot(&mut self, kind: EntityKind) -> &mut u64 {
        match kind {
            EntityKind::Conversation => &mut self.conversations,
            EntityKind::Message => &mut self.messages,
            EntityKind::Artifact => &mut self.artifacts,
        }
    }

    fn increment(&mut self, kind: EntityKind) {
        *self.slot(kind) += 1;
    }

    fn decrement(&mut self, kind: EntityKind) {
        let slot = self.slot(kind);
        *slot = slot.saturating_sub(1);
    }
}

/// Why a record is held out of (or forced into) the upload queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MarkerKind {
    /// The remote holds a different version; a local edit or an explicit
    /// resolution is needed before it is submitted again.
    Conflict = 1,
    /// The remote refused the record permanently.
    Rejected = 2,
    /// A conflict was resolved in favour of the local copy; the next
    /// submission overwrites the remote.
    Resolved = 3,
}

impl MarkerKind {
    /// Converts a log byte to a kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Conflict),
            2 => Some(Self::Rejected),
            3 => Some(Self::Resolved),
            _ => None,
        }
    }

    /// Converts the kind to its log byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// True if a record carrying this marker stays out of snapshots.
    #[must_use]
    pub const fn holds_back(self) -> bool {
        matches!(self, Self::Conflict | Self::Rejected)
    }
}

/// A marker attached to a record by the sync coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMarker {
    /// What happened.
    pub kind: MarkerKind,
    /// Reason reported by the remote, or a local note.
    pub reason: String,
    /// When it happened, at millisecond precision.
    pub detected_at: DateTime<Utc>,
}

impl SyncMarker {
    /// Creates a marker. `detected_at` is truncated to milliseconds, the
    /// precision the log keeps.
    pub fn new(kind: MarkerKind, reason: impl Into<String>, detected_at: DateTime<Utc>) -> Self {
        let detected_at =
            DateTime::from_timestamp_millis(detected_at.timestamp_millis()).unwrap_or(detected_at);
        Self {
            kind,
            reason: reason.into(),
            detected_at,
        }
    }

    /// A conflict marker stamped now.
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::new(MarkerKind::Conflict, reason, Utc::now())
    }

    /// A rejection marker stamped now.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(MarkerKind::Rejected, reason, Utc::now())
    }

    /// A resolution marker stamped now.
    pub fn resolved() -> Self {
        Self::new(MarkerKind::Resolved, "resolved: keep local", Utc::now())
    }
}

/// Ledger state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Bumped on every local write of the record.
    pub revision: u64,
    /// True once the remote acknowledged `revision`.
    pub synced: bool,
    /// Position in the upload queue while pending.
    pub order: u64,
}

/// One entry of a pending snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    /// The record.
    pub key: RecordKey,
    /// The revision to acknowledge after a successful submit.
    pub revision: u64,
    /// Submit as an overwrite of the remote copy.
    pub overwrite: bool,
}

/// Result of [`crate::LocalStore::mark_synced`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkSyncedOutcome {
    /// The record is now synced.
    Synced,
    /// The record was already synced; nothing changed.
    AlreadySynced,
    /// The record was written again after the acknowledged revision; it
    /// stays pending.
    Superseded {
        /// The record's current revision.
        current: u64,
    },
}

/// Per-record sync classification with O(1) pending counters.
#[derive(Debug, Clone, Default)]
pub struct SyncLedger {
    entries: HashMap<RecordKey, LedgerEntry>,
    queue: BTreeMap<u64, RecordKey>,
    markers: BTreeMap<RecordKey, SyncMarker>,
    counts: PendingCounts,
    next_order: u64,
    last_revision: u64,
}

impl SyncLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending counts per kind.
    #[must_use]
    pub fn pending_counts(&self) -> PendingCounts {
        self.counts
    }

    /// The entry for `key`, if tracked.
    #[must_use]
    pub fn entry(&self, key: &RecordKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    /// True if `key` is tracked and pending.
    #[must_use]
    pub fn is_pending(&self, key: &RecordKey) -> bool {
        self.entries.get(key).is_some_and(|e| !e.synced)
    }

    /// Number of tracked records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The marker on `key`, if any.
    #[must_use]
    pub fn marker(&self, key: &RecordKey) -> Option<&SyncMarker> {
        self.markers.get(key)
    }

    /// All markers, ordered by key.
    pub fn markers(&self) -> impl Iterator<Item = (&RecordKey, &SyncMarker)> {
        self.markers.iter()
    }

    /// Pending records in the order they became pending.
    pub fn pending(&self) -> impl Iterator<Item = &RecordKey> {
        self.queue.values()
    }

    /// The pending records the coordinator may submit now, in queue order.
    ///
    /// Records under a [`MarkerKind::Conflict`] or [`MarkerKind::Rejected`]
    /// marker are left out; records under [`MarkerKind::Resolved`] are
    /// included as overwrites.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingRecord> {
        self.queue
            .values()
            .filter_map(|key| {
                let marker = self.markers.get(key);
                if marker.is_some_and(|m| m.kind.holds_back()) {
                    return None;
                }
                let entry = self.entries.get(key)?;
                Some(PendingRecord {
                    key: key.clone(),
                    revision: entry.revision,
                    overwrite: marker.is_some_and(|m| m.kind == MarkerKind::Resolved),
                })
            })
            .collect()
    }

    /// Recomputes the counters from the entries. Equal to
    /// [`Self::pending_counts`] unless the ledger is damaged.
    #[must_use]
    pub fn recount(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for (key, entry) in &self.entries {
            if !entry.synced {
                counts.increment(key.kind);
            }
        }
        counts
    }

    /// Checks the queue against the entries.
    pub(crate) fn queue_consistent(&self) -> bool {
        let pending = self.entries.values().filter(|e| !e.synced).count();
        pending == self.queue.len()
            && self
                .queue
                .iter()
                .all(|(order, key)| self.entries.get(key).is_some_and(|e| !e.synced && e.order == *order))
    }

    pub(crate) fn next_order(&self) -> u64 {
        self.next_order
    }

    pub(crate) fn set_next_order(&mut self, next_order: u64) {
        self.next_order = next_order;
    }

    /// The highest revision handed out so far, by any record.
    #[must_use]
    pub fn last_revision(&self) -> u64 {
        self.last_revision
    }

    pub(crate) fn set_last_revision(&mut self, revision: u64) {
        self.last_revision = revision;
    }

    /// Makes every later revision exceed `floor`.
    pub(crate) fn raise_revision_floor(&mut self, floor: u64) {
        self.last_revision = self.last_revision.max(floor);
    }

    /// Revisions come from one store-wide counter, so a key that is deleted
    /// and written again never reuses a revision an acknowledgment may
    /// still carry.
    fn take_revision(&mut self) -> u64 {
        self.last_revision += 1;
        self.last_revision
    }

    fn take_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    /// Replaces the entry for `key`, keeping counters and queue in step.
    pub(crate) fn set_entry(&mut self, key: &RecordKey, entry: Option<LedgerEntry>) {
        let previous = match entry {
            Some(entry) => self.entries.insert(key.clone(), entry),
            None => self.entries.remove(key),
        };
        if let Some(previous) = previous.filter(|p| !p.synced) {
            self.counts.decrement(key.kind);
            self.queue.remove(&previous.order);
        }
        if let Some(entry) = entry.filter(|e| !e.synced) {
            self.counts.increment(key.kind);
            self.queue.insert(entry.order, key.clone());
        }
    }

    pub(crate) fn set_marker(&mut self, key: &RecordKey, marker: Option<SyncMarker>) {
        match marker {
            Some(marker) => {
                self.markers.insert(key.clone(), marker);
            }
            None => {
                self.markers.remove(key);
            }
        }
    }

    /// A local write of `key`: bumps the revision and takes the flag the
    /// written entity carries. A record that stays pending keeps its queue
    /// position. Conflict and rejection markers are cleared, since the
    /// edit is the user's answer to them.
    pub(crate) fn record_put(&mut self, key: &RecordKey, synced: bool) {
        let previous = self.entries.get(key).copied();
        let revision = self.take_revision();
        let order = match previous {
            Some(p) if !p.synced && !synced => p.order,
            Some(p) if synced => p.order,
            _ if synced => 0,
            _ => self.take_order(),
        };
        self.set_entry(
            key,
            Some(LedgerEntry {
                revision,
                synced,
                order,
            }),
        );
        if self.markers.get(key).is_some_and(|m| m.kind.holds_back()) {
            self.markers.remove(key);
        }
    }

    /// Flags a tracked record as pending and clears a conflict or rejection
    /// marker. A synced record gets a new revision and goes to the back of
    /// the queue; a record that already was pending keeps both. Returns
    /// whether the flag changed.
    pub(crate) fn record_pending(&mut self, key: &RecordKey) -> bool {
        let Some(current) = self.entries.get(key).copied() else {
            return false;
        };
        if self.markers.get(key).is_some_and(|m| m.kind.holds_back()) {
            self.markers.remove(key);
        }
        if !current.synced {
            return false;
        }
        let order = self.take_order();
        let revision = self.take_revision();
        self.set_entry(
            key,
            Some(LedgerEntry {
                revision,
                synced: false,
                order,
            }),
        );
        true
    }

    /// True if `mark_pending` on `key` would change anything.
    pub(crate) fn needs_pending(&self, key: &RecordKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.synced)
            || self.markers.get(key).is_some_and(|m| m.kind.holds_back())
    }

    /// Flags `key` as synced if it is pending at exactly `revision`.
    /// Clears any marker on success. Returns whether anything changed.
    pub(crate) fn record_synced(&mut self, key: &RecordKey, revision: u64) -> bool {
        let Some(current) = self.entries.get(key).copied() else {
            return false;
        };
        if current.synced || current.revision != revision {
            return false;
        }
        self.set_entry(
            key,
            Some(LedgerEntry {
                synced: true,
                ..current
            }),
        );
        self.markers.remove(key);
        true
    }

    /// Stops tracking `key`. The revision counter is left alone.
    pub(crate) fn forget(&mut self, key: &RecordKey) {
        self.set_entry(key, None);
        self.markers.remove(key);
    }
}
