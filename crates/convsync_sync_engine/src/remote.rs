//! The remote collaborator seam.
//!
//! The engine does not define a wire protocol. The application implements
//! [`RemoteCollaborator`] over whatever transport its backend speaks, and
//! the coordinator only needs to know, per record, whether the remote
//! accepted it.

use async_trait::async_trait;
use convsync_core::{Entity, RecordKey};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;

/// One record as submitted to the remote.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    /// The record.
    pub key: RecordKey,
    /// Local revision being submitted.
    pub revision: u64,
    /// The record content.
    pub entity: Entity,
    /// SHA-256 of the content, independent of the sync flag.
    pub digest: [u8; 32],
    /// Replace the remote copy even if it changed; set after a conflict
    /// was resolved in favour of the local copy.
    pub overwrite: bool,
}

/// The remote's verdict on one submitted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored; the local record is now synced.
    Accepted,
    /// The remote holds a different version.
    Conflict {
        /// Reason reported by the remote.
        reason: String,
    },
    /// Refused permanently.
    Rejected {
        /// Reason reported by the remote.
        reason: String,
    },
}

/// A failure worth retrying later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network down, server unavailable, rate limited.
    #[error("transient remote failure: {0}")]
    Transient(String),
    /// The remote did not answer in time.
    #[error("remote timed out")]
    Timeout,
}

/// Changes the remote has seen since a cursor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteChanges {
    /// Remote versions of records, in any order.
    pub records: Vec<Entity>,
    /// Cursor to ask from next time.
    pub cursor: i64,
    /// More changes are waiting past `cursor`.
    pub has_more: bool,
}

/// The remote end of synchronization.
///
/// Implementations must be idempotent per `(key, revision)`: after a
/// timeout the coordinator cannot know whether a submission landed and
/// will submit it again.
#[async_trait]
pub trait RemoteCollaborator: Send + Sync + 'static {
    /// Submits one record.
    async fn submit(&self, record: &SyncRecord) -> Result<SubmitOutcome, RemoteError>;

    /// Fetches remote changes after `cursor` (`None` = from the beginning).
    ///
    /// Returns `Ok(None)` if the remote does not offer a change feed, which
    /// is the default.
    async fn fetch_changes(&self, cursor: Option<i64>) -> Result<Option<RemoteChanges>, RemoteError> {
        let _ = cursor;
        Ok(None)
    }
}

#[derive(Debug, Default)]
struct MockState {
    submissions: Vec<SyncRecord>,
    queued: VecDeque<Result<SubmitOutcome, RemoteError>>,
    by_key: HashMap<RecordKey, SubmitOutcome>,
    changes: VecDeque<RemoteChanges>,
    cursors_seen: Vec<Option<i64>>,
    latency: Duration,
    pull_enabled: bool,
}

/// A scriptable remote for tests.
///
/// Accepts everything unless told otherwise. Responses queued with
/// [`MockRemote::push_response`] are consumed one per submission, before
/// per-key verdicts set with [`MockRemote::respond_to`].
#[derive(Debug, Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
}

impl MockRemote {
    /// Creates a mock that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the response for the next submission.
    pub fn push_response(&self, response: Result<SubmitOutcome, RemoteError>) {
        self.state.lock().queued.push_back(response);
    }

    /// Makes the next `count` submissions fail transiently.
    pub fn fail_next(&self, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state
                .queued
                .push_back(Err(RemoteError::Transient("injected failure".into())));
        }
    }

    /// Answers every submission of `key` with `outcome`.
    pub fn respond_to(&self, key: RecordKey, outcome: SubmitOutcome) {
        self.state.lock().by_key.insert(key, outcome);
    }

    /// Stops answering `key` specially.
    pub fn clear_response(&self, key: &RecordKey) {
        self.state.lock().by_key.remove(key);
    }

    /// Delays every call by `latency` (tokio time, so paused-clock tests
    /// can step through it).
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Queues a page of remote changes and turns the change feed on.
    pub fn queue_changes(&self, changes: RemoteChanges) {
        let mut state = self.state.lock();
        state.pull_enabled = true;
        state.changes.push_back(changes);
    }

    /// Every record submitted so far, in order.
    pub fn submissions(&self) -> Vec<SyncRecord> {
        self.state.lock().submissions.clone()
    }

    /// Keys submitted so far, in order.
    pub fn submitted_keys(&self) -> Vec<RecordKey> {
        self.state
            .lock()
            .submissions
            .iter()
            .map(|r| r.key.clone())
            .collect()
    }

    /// Number of submissions so far.
    pub fn submit_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Cursors passed to `fetch_changes`, in order.
    pub fn cursors_seen(&self) -> Vec<Option<i64>> {
        self.state.lock().cursors_seen.clone()
    }
}

#[async_trait]
impl RemoteCollaborator for MockRemote {
    async fn submit(&self, record: &SyncRecord) -> Result<SubmitOutcome, RemoteError> {
        let (latency, response) = {
            let mut state = self.state.lock();
            state.submissions.push(record.clone());
            let response = match state.queued.pop_front() {
                Some(response) => response,
                None => Ok(state
                    .by_key
                    .get(&record.key)
                    .cloned()
                    .unwrap_or(SubmitOutcome::Accepted)),
            };
            (state.latency, response)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        response
    }

    async fn fetch_changes(&self, cursor: Option<i64>) -> Result<Option<RemoteChanges>, RemoteError> {
        let (latency, changes) = {
            let mut state = self.state.lock();
            state.cursors_seen.push(cursor);
            if !state.pull_enabled {
                return Ok(None);
            }
            let changes = state.changes.pop_front().unwrap_or_else(|| RemoteChanges {
                records: Vec::new(),
                cursor: cursor.unwrap_or(0),
                has_more: false,
            });
            (state.latency, changes)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(Some(changes))
    }
}
