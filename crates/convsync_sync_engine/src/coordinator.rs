//! The sync coordinator state machine.
//!
//! One tokio task owns the state. It waits in `Idle` until connectivity
//! comes back or a save triggers it, drains a snapshot of the pending
//! records in `Draining`, and sleeps in `Backoff` after a transient
//! failure. Losing connectivity drops the in-flight drain; every record it
//! did not get an answer for stays pending.

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityState;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteChanges, RemoteCollaborator, SubmitOutcome, SyncRecord};
use chrono::Utc;
use convsync_core::{
    content_digest, CoreError, CoreResult, Entity, LocalStore, MarkSyncedOutcome, MarkerKind,
    MetaKey, PendingRecord, RecordKey, RemoteApply, SyncMarker,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// The coordinator's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    /// Waiting for connectivity or a trigger.
    #[default]
    Idle,
    /// Pushing the pending snapshot.
    Draining,
    /// Waiting to retry after a transient failure.
    Backoff {
        /// Consecutive failed cycles, starting at 1.
        attempt: u32,
        /// When the next cycle starts.
        retry_at: Instant,
    },
}

impl CoordinatorState {
    /// Returns true while a drain cycle runs.
    pub fn is_draining(&self) -> bool {
        matches!(self, CoordinatorState::Draining)
    }

    /// Returns true while waiting to retry.
    pub fn is_backoff(&self) -> bool {
        matches!(self, CoordinatorState::Backoff { .. })
    }
}

/// What one drain cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Remote records applied locally.
    pub pulled: usize,
    /// Remote records that collided with pending local edits.
    pub pull_conflicts: usize,
    /// Records submitted.
    pub submitted: usize,
    /// Records acknowledged and marked synced.
    pub synced: usize,
    /// Records acknowledged but edited again meanwhile; still pending.
    pub superseded: usize,
    /// Records the remote reported in conflict.
    pub conflicts: usize,
    /// Records the remote refused.
    pub rejected: usize,
    /// Snapshot records deleted or synced before their turn.
    pub skipped: usize,
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that ran to the end.
    pub cycles_completed: u64,
    /// Cycles that ended in backoff.
    pub cycles_failed: u64,
    /// Cycles dropped because connectivity went away.
    pub cycles_cancelled: u64,
    /// Records marked synced.
    pub records_synced: u64,
    /// Remote records applied locally.
    pub records_pulled: u64,
    /// Conflict markers raised.
    pub conflicts: u64,
    /// Rejection markers raised.
    pub rejections: u64,
    /// The last cycle that ran to the end.
    pub last_cycle: Option<CycleReport>,
    /// The last error message.
    pub last_error: Option<String>,
}

/// Control handle for a running coordinator.
///
/// Dropping the handle stops the coordinator.
#[derive(Debug)]
pub struct CoordinatorHandle {
    wake: Arc<Notify>,
    state: watch::Receiver<CoordinatorState>,
    stats: Arc<RwLock<SyncStats>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorHandle {
    /// Asks for a drain cycle. Ignored while offline; a trigger during a
    /// cycle schedules another one right after it.
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Like [`Self::trigger`], but reports a coordinator that is no longer
    /// running.
    ///
    /// # Errors
    ///
    /// [`SyncError::Shutdown`] once shutdown was requested or the task ended.
    pub fn try_trigger(&self) -> SyncResult<()> {
        if *self.shutdown.borrow() || self.is_finished() {
            return Err(SyncError::Shutdown);
        }
        self.trigger();
        Ok(())
    }

    /// The current state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// A receiver of state changes.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.clone()
    }

    /// A copy of the running totals.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true once the coordinator task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.lock().as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the coordinator and waits for its task. An in-flight cycle
    /// is dropped.
    ///
    /// # Errors
    ///
    /// [`SyncError::Cancelled`] if the task was aborted from elsewhere.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };
        match task.await {
            Ok(()) => Ok(()),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(SyncError::Cancelled),
        }
    }
}

/// Drives pending records from a [`LocalStore`] to a remote.
pub struct SyncCoordinator<R: RemoteCollaborator> {
    store: Arc<LocalStore>,
    remote: Arc<R>,
    config: SyncConfig,
    wake: Arc<Notify>,
    state: watch::Sender<CoordinatorState>,
    stats: Arc<RwLock<SyncStats>>,
}

impl<R: RemoteCollaborator> SyncCoordinator<R> {
    /// Starts a coordinator task on the current tokio runtime.
    ///
    /// If `connectivity` already reads online, a first cycle starts
    /// immediately.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(
        store: Arc<LocalStore>,
        remote: Arc<R>,
        connectivity: watch::Receiver<ConnectivityState>,
        config: SyncConfig,
    ) -> CoordinatorHandle {
        let wake = Arc::new(Notify::new());
        let stats = Arc::new(RwLock::new(SyncStats::default()));
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = Self {
            store,
            remote,
            config,
            wake: Arc::clone(&wake),
            state: state_tx,
            stats: Arc::clone(&stats),
        };
        let task = tokio::spawn(coordinator.run(connectivity, shutdown_rx));

        CoordinatorHandle {
            wake,
            state: state_rx,
            stats,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    fn transition(&self, next: CoordinatorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "sync state");
        }
    }

    async fn run(
        self,
        mut connectivity: watch::Receiver<ConnectivityState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut online = connectivity.borrow_and_update().is_online();
        let mut drain_requested = online;
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let current = *self.state.borrow();
            match current {
                CoordinatorState::Idle => {
                    if online && drain_requested {
                        drain_requested = false;
                        self.transition(CoordinatorState::Draining);
                        continue;
                    }
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        changed = connectivity.changed() => {
                            if changed.is_err() {
                                tracing::warn!("connectivity monitor gone; coordinator stopping");
                                break;
                            }
                            let now_online = connectivity.borrow_and_update().is_online();
                            if now_online && !online {
                                tracing::info!("connectivity restored");
                                drain_requested = true;
                            }
                            online = now_online;
                        }
                        _ = self.wake.notified() => {
                            if online {
                                drain_requested = true;
                            } else {
                                tracing::trace!("sync trigger ignored while offline");
                            }
                        }
                    }
                }

                CoordinatorState::Draining => {
                    let outcome = tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = wait_offline(&mut connectivity) => None,
                        result = self.drain_cycle() => Some(result),
                    };

                    match outcome {
                        None => {
                            online = false;
                            attempt = 0;
                            self.stats.write().cycles_cancelled += 1;
                            tracing::info!("connectivity lost; drain cancelled");
                            self.transition(CoordinatorState::Idle);
                        }
                        Some(Ok(report)) => {
                            attempt = 0;
                            {
                                let mut stats = self.stats.write();
                                stats.cycles_completed += 1;
                                stats.records_synced += report.synced as u64;
                                stats.records_pulled += report.pulled as u64;
                                stats.conflicts += (report.conflicts + report.pull_conflicts) as u64;
                                stats.rejections += report.rejected as u64;
                                stats.last_cycle = Some(report);
                            }
                            tracing::info!(
                                pulled = report.pulled,
                                submitted = report.submitted,
                                synced = report.synced,
                                conflicts = report.conflicts + report.pull_conflicts,
                                rejected = report.rejected,
                                "drain cycle complete"
                            );
                            self.transition(CoordinatorState::Idle);
                        }
                        Some(Err(err)) if err.is_transient() => {
                            attempt = attempt.saturating_add(1);
                            let delay = self.config.backoff.delay_for_attempt(attempt);
                            {
                                let mut stats = self.stats.write();
                                stats.cycles_failed += 1;
                                stats.last_error = Some(err.to_string());
                            }
                            tracing::warn!(error = %err, attempt, ?delay, "drain cycle failed; backing off");
                            self.transition(CoordinatorState::Backoff {
                                attempt,
                                retry_at: Instant::now() + delay,
                            });
                        }
                        Some(Err(err)) => {
                            self.stats.write().last_error = Some(err.to_string());
                            tracing::error!(error = %err, "drain cycle aborted");
                            self.transition(CoordinatorState::Idle);
                        }
                    }
                }

                CoordinatorState::Backoff { retry_at, .. } => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        changed = connectivity.changed() => {
                            if changed.is_err() {
                                tracing::warn!("connectivity monitor gone; coordinator stopping");
                                break;
                            }
                            online = connectivity.borrow_and_update().is_online();
                            if !online {
                                tracing::info!("connectivity lost during backoff");
                                attempt = 0;
                                self.transition(CoordinatorState::Idle);
                            }
                        }
                        // The retry covers whatever the trigger wanted.
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep_until(retry_at) => {
                            self.transition(CoordinatorState::Draining);
                        }
                    }
                }
            }
        }

        tracing::debug!("sync coordinator stopped");
    }

    /// Pull, then push the pending snapshot.
    async fn drain_cycle(&self) -> SyncResult<CycleReport> {
        let mut report = CycleReport::default();
        self.pull(&mut report).await?;

        let snapshot = self.blocking(|store| Ok(store.snapshot())).await?;
        tracing::debug!(records = snapshot.len(), "drain snapshot");

        for chunk in snapshot.chunks(self.config.batch_size.max(1)) {
            let wanted: Vec<PendingRecord> = chunk.to_vec();
            let loaded = self
                .blocking(move |store| {
                    Ok(wanted
                        .into_iter()
                        .map(|pending| {
                            let tracked = store.get_tracked(&pending.key);
                            (pending, tracked)
                        })
                        .collect::<Vec<_>>())
                })
                .await?;

            for (pending, tracked) in loaded {
                let Some((entity, entry)) = tracked.filter(|(_, entry)| !entry.synced) else {
                    tracing::trace!(key = %pending.key, "skipping record no longer pending");
                    report.skipped += 1;
                    continue;
                };

                let record = SyncRecord {
                    key: pending.key,
                    revision: entry.revision,
                    digest: content_digest(&entity)?,
                    entity,
                    overwrite: pending.overwrite,
                };
                let outcome = self.submit(&record).await?;
                report.submitted += 1;
                self.record_outcome(record, outcome, &mut report).await?;
            }
        }

        let finished_at = Utc::now().timestamp_millis();
        self.blocking(move |store| store.set_meta(MetaKey::LastFullSync, finished_at))
            .await?;
        Ok(report)
    }

    async fn submit(&self, record: &SyncRecord) -> SyncResult<SubmitOutcome> {
        tracing::trace!(key = %record.key, revision = record.revision, overwrite = record.overwrite, "submitting");
        match tokio::time::timeout(self.config.submit_timeout, self.remote.submit(record)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    async fn record_outcome(
        &self,
        record: SyncRecord,
        outcome: SubmitOutcome,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let SyncRecord { key, revision, .. } = record;
        match outcome {
            SubmitOutcome::Accepted => {
                let acknowledged = key.clone();
                let result = self
                    .blocking(move |store| match store.mark_synced(&acknowledged, Some(revision)) {
                        Err(CoreError::UnknownRecord(_)) => Ok(None),
                        other => other.map(Some),
                    })
                    .await?;
                match result {
                    Some(MarkSyncedOutcome::Synced) => report.synced += 1,
                    Some(MarkSyncedOutcome::Superseded { current }) => {
                        tracing::debug!(%key, revision, current, "record edited while in flight");
                        report.superseded += 1;
                    }
                    Some(MarkSyncedOutcome::AlreadySynced) | None => report.skipped += 1,
                }
            }
            SubmitOutcome::Conflict { reason } => {
                tracing::warn!(%key, %reason, "remote reported conflict; keeping local copy");
                if self.flag(key, revision, SyncMarker::conflict(reason)).await? {
                    report.conflicts += 1;
                }
            }
            SubmitOutcome::Rejected { reason } => {
                tracing::warn!(%key, %reason, "remote rejected record");
                if self.flag(key, revision, SyncMarker::rejected(reason)).await? {
                    report.rejected += 1;
                }
            }
        }
        Ok(())
    }

    /// Attaches `marker` unless the record moved past `revision`.
    async fn flag(&self, key: RecordKey, revision: u64, marker: SyncMarker) -> SyncResult<bool> {
        self.blocking(move |store| {
            store.transaction(|txn| match txn.ledger().entry(&key).copied() {
                Some(entry) if !entry.synced && entry.revision == revision => {
                    txn.set_marker(&key, marker)?;
                    Ok(true)
                }
                _ => Ok(false),
            })
        })
        .await
    }

    async fn pull(&self, report: &mut CycleReport) -> SyncResult<()> {
        loop {
            let cursor = self.store.meta(MetaKey::ServerCursor);
            let fetched = match tokio::time::timeout(
                self.config.submit_timeout,
                self.remote.fetch_changes(cursor),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(SyncError::Timeout),
            };
            let Some(changes) = fetched else {
                return Ok(());
            };

            let has_more = changes.has_more;
            let next_cursor = changes.cursor;
            let (applied, conflicts) = self
                .blocking(move |store| apply_changes(store, changes))
                .await?;
            report.pulled += applied;
            report.pull_conflicts += conflicts;
            tracing::debug!(applied, conflicts, cursor = next_cursor, "pulled remote changes");

            if !has_more || cursor == Some(next_cursor) {
                return Ok(());
            }
        }
    }

    async fn blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&LocalStore) -> CoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || f(&store)).await {
            Ok(result) => Ok(result?),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(SyncError::Cancelled),
        }
    }
}

/// Resolves once connectivity is not online. A closed channel never
/// resolves: a monitor that went away is not an offline report.
async fn wait_offline(rx: &mut watch::Receiver<ConnectivityState>) {
    loop {
        if !rx.borrow_and_update().is_online() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Applies one page of remote changes and advances the cursor, in one
/// transaction. Returns `(applied, conflicts)`.
fn apply_changes(store: &LocalStore, changes: RemoteChanges) -> CoreResult<(usize, usize)> {
    let RemoteChanges {
        mut records,
        cursor,
        ..
    } = changes;
    records.sort_by_key(Entity::kind);

    store.transaction(|txn| {
        let mut applied = 0;
        let mut conflicts = 0;
        for entity in records {
            let key = entity.key();
            match txn.apply_remote(entity) {
                Ok(RemoteApply::Applied | RemoteApply::Acknowledged) => applied += 1,
                Ok(RemoteApply::LocalPending) => {
                    let marked = txn.ledger().marker(&key).map(|m| m.kind);
                    if marked.is_none() {
                        tracing::warn!(%key, "remote copy changed while local edits were pending");
                        txn.set_marker(
                            &key,
                            SyncMarker::conflict("remote copy changed while local edits were pending"),
                        )?;
                        conflicts += 1;
                    } else if marked != Some(MarkerKind::Resolved) {
                        tracing::trace!(%key, "remote change on flagged record ignored");
                    }
                }
                Err(CoreError::Integrity { message }) => {
                    tracing::warn!(%key, %message, "skipping remote record");
                }
                Err(err) => return Err(err),
            }
        }
        txn.set_meta(MetaKey::ServerCursor, cursor);
        Ok((applied, conflicts))
    })
}
