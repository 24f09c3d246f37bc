//! The local store: keyed entities over a write-ahead log.

use crate::codec::{content_digest, encode_entity};
use crate::config::StoreConfig;
use crate::dir::StoreDir;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{
    LedgerEntry, MarkSyncedOutcome, MarkerKind, PendingCounts, PendingRecord, SyncLedger, SyncMarker,
};
use crate::model::{Artifact, Conversation, Entity, Message};
use crate::state::{StoreState, Undo};
use crate::types::{EntityKind, MetaKey, RecordKey, SequenceNumber, TransactionId};
use crate::wal::{Wal, WalRecord};
use chrono::{DateTime, Utc};
use convsync_storage::{FileBackend, InMemoryBackend, StorageBackend};
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// The local store.
///
/// Holds every conversation, message and artifact in memory, rebuilt from
/// the log on open, and keeps the [`SyncLedger`] in step with them.
///
/// Writers are serialized by a mutex around the log; readers take a shared
/// lock on the in-memory state and never wait on I/O.
///
/// # Example
///
/// ```rust
/// use convsync_core::{Conversation, LocalStore, Message, Role};
///
/// let store = LocalStore::open_in_memory().unwrap();
/// let conversation = Conversation::new("Trip ideas");
/// let message = Message::new(&conversation.id, Role::User, "Where to in May?");
///
/// store.put(conversation.clone()).unwrap();
/// store.put(message).unwrap();
///
/// assert_eq!(store.list_by_conversation(&conversation.id).count(), 1);
/// assert_eq!(store.pending_counts().messages, 1);
/// ```
pub struct LocalStore {
    config: StoreConfig,
    dir: Option<StoreDir>,
    wal: Mutex<Wal>,
    state: RwLock<StoreState>,
    poisoned: AtomicBool,
    compacted_bytes: AtomicU64,
}

/// Counters describing a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Stored conversations.
    pub conversations: usize,
    /// Stored messages.
    pub messages: usize,
    /// Stored artifacts.
    pub artifacts: usize,
    /// Pending records per kind.
    pub pending: PendingCounts,
    /// Records under a conflict, rejection or resolution marker.
    pub markers: usize,
    /// Log size in bytes.
    pub log_bytes: u64,
    /// Sequence number of the last commit.
    pub last_sequence: SequenceNumber,
}

/// Result of [`LocalStore::compact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Log size before.
    pub bytes_before: u64,
    /// Log size after.
    pub bytes_after: u64,
    /// Records in the rewritten log.
    pub records: usize,
}

/// Result of applying a remote version of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Stored as synced.
    Applied,
    /// The local copy is pending with identical content; it was marked
    /// synced instead.
    Acknowledged,
    /// The local copy is pending with different content and was left
    /// alone.
    LocalPending,
}

impl LocalStore {
    /// Opens (or creates) a store in `path`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Locked`] if another process holds the directory
    /// - [`CoreError::Corruption`] / [`CoreError::ChecksumMismatch`] if the
    ///   log cannot be replayed
    pub fn open(path: &Path, config: StoreConfig) -> CoreResult<Self> {
        let dir = StoreDir::open(path, config.create_if_missing)?;
        dir.remove_stale_compaction()?;
        let backend = FileBackend::open(&dir.log_path())?;
        Self::open_inner(Box::new(backend), Some(dir), config)
    }

    /// Opens an empty store that lives in memory only.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches the other openers.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), StoreConfig::default())
    }

    /// Opens a store over an arbitrary backend, replaying what it holds.
    ///
    /// # Errors
    ///
    /// Fails if the log cannot be replayed.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: StoreConfig,
    ) -> CoreResult<Self> {
        Self::open_inner(backend, None, config)
    }

    fn open_inner(
        backend: Box<dyn StorageBackend>,
        dir: Option<StoreDir>,
        config: StoreConfig,
    ) -> CoreResult<Self> {
        let mut wal = Wal::new(backend, config.sync_on_commit);
        let (state, report) = StoreState::replay(&mut wal)?;

        tracing::debug!(
            transactions = report.transactions,
            bytes = report.committed_bytes,
            pending = state.ledger.pending_counts().total(),
            "store opened"
        );

        Ok(Self {
            config,
            dir,
            wal: Mutex::new(wal),
            state: RwLock::new(state),
            poisoned: AtomicBool::new(false),
            compacted_bytes: AtomicU64::new(report.committed_bytes),
        })
    }

    /// Deletes the store in `path`, leaving an empty directory.
    ///
    /// # Errors
    ///
    /// Fails with [`CoreError::Locked`] while the store is open.
    pub fn destroy(path: &Path) -> CoreResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let dir = StoreDir::open(path, false)?;
        dir.wipe()?;
        tracing::info!(path = %path.display(), "store destroyed");
        Ok(())
    }

    /// The store directory, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(StoreDir::path)
    }

    /// The configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// True after a failed write could not be rolled back. Every mutation
    /// fails from then on; reopen the store.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.is_poisoned() {
            return Err(CoreError::Poisoned);
        }
        Ok(())
    }

    fn poison(&self, err: &CoreError) {
        self.poisoned.store(true, Ordering::SeqCst);
        tracing::error!(error = %err, "store poisoned");
    }

    /// Runs `f` as one atomic transaction.
    ///
    /// Mutations are visible to later reads inside `f`. If `f` returns an
    /// error, or the commit cannot be made durable, every mutation is
    /// reverted and the log is left as it was. A transaction that changes
    /// nothing writes nothing.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or the write error.
    pub fn transaction<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> CoreResult<T>,
    {
        self.ensure_writable()?;

        let value = {
            let mut wal = self.wal.lock();
            let mut state = self.state.write();

            let txid = TransactionId::new(state.last_txid.as_u64() + 1);
            let mut txn = Transaction::new(&mut *state, txid, Utc::now());
            let result = f(&mut txn);
            let (records, undo) = txn.into_parts();

            let value = match result {
                Ok(value) => value,
                Err(err) => {
                    state.revert_all(undo);
                    return Err(err);
                }
            };
            if records.is_empty() {
                return Ok(value);
            }

            let sequence = state.last_sequence.next();
            let mut framed = Vec::with_capacity(records.len() + 2);
            framed.push(WalRecord::Begin { txid });
            framed.extend(records);
            framed.push(WalRecord::Commit {
                txid,
                sequence,
                counts: state.ledger.pending_counts(),
            });

            if let Err(err) = wal.append_batch(&framed) {
                state.revert_all(undo);
                if matches!(err, CoreError::Poisoned) {
                    self.poison(&err);
                }
                return Err(err);
            }

            state.last_txid = txid;
            state.last_sequence = sequence;
            tracing::trace!(%txid, %sequence, records = framed.len(), "committed");
            value
        };

        self.maybe_auto_compact();
        Ok(value)
    }

    // ---- writes ---------------------------------------------------------

    /// Inserts or replaces an entity.
    ///
    /// The entity's `synced` flag decides its ledger state. A new message
    /// is appended to its conversation, which is touched.
    ///
    /// # Errors
    ///
    /// [`CoreError::Integrity`] if a message references an unknown
    /// conversation or moves to another one.
    pub fn put(&self, entity: impl Into<Entity>) -> CoreResult<()> {
        let entity = entity.into();
        self.transaction(|txn| txn.put(entity))
    }

    /// Writes many entities in one transaction. Conversations are written
    /// before messages so a batch may carry both.
    ///
    /// # Errors
    ///
    /// Fails as [`Self::put`] would; nothing is written on failure.
    pub fn put_batch(&self, entities: Vec<Entity>) -> CoreResult<usize> {
        let mut entities = entities;
        entities.sort_by_key(Entity::kind);
        self.transaction(|txn| {
            let count = entities.len();
            for entity in entities {
                txn.put(entity)?;
            }
            Ok(count)
        })
    }

    /// Deletes an entity. A conversation takes its messages with it.
    /// Returns false if there was nothing to delete.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn delete(&self, kind: EntityKind, id: &str) -> CoreResult<bool> {
        self.transaction(|txn| txn.delete(kind, id))
    }

    /// Flags a record as pending.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownRecord`] if the record does not exist.
    pub fn mark_pending(&self, key: &RecordKey) -> CoreResult<bool> {
        self.transaction(|txn| txn.mark_pending(key))
    }

    /// Flags a record as synced. With `revision`, only if the record was
    /// not written again since that revision.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownRecord`] if the record is not tracked.
    pub fn mark_synced(
        &self,
        key: &RecordKey,
        revision: Option<u64>,
    ) -> CoreResult<MarkSyncedOutcome> {
        self.transaction(|txn| txn.mark_synced(key, revision))
    }

    /// Sets a metadata slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_meta(&self, key: MetaKey, value: i64) -> CoreResult<()> {
        self.transaction(|txn| {
            txn.set_meta(key, value);
            Ok(())
        })
    }

    // ---- reads ----------------------------------------------------------

    /// Returns the entity, or `None` if absent.
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        self.state.read().get(kind, id).cloned()
    }

    /// Returns a message.
    #[must_use]
    pub fn get_message(&self, id: &str) -> Option<Message> {
        self.state.read().message(id).cloned()
    }

    /// Returns a conversation.
    #[must_use]
    pub fn get_conversation(&self, id: &str) -> Option<Conversation> {
        self.state.read().conversation(id).cloned()
    }

    /// Returns an artifact.
    #[must_use]
    pub fn get_artifact(&self, id: &str) -> Option<Artifact> {
        self.get(EntityKind::Artifact, id)
            .and_then(Entity::into_artifact)
    }

    /// All entities of one kind, in id order.
    #[must_use]
    pub fn list_all(&self, kind: EntityKind) -> Vec<Entity> {
        self.state.read().of_kind(kind).cloned().collect()
    }

    /// All conversations, in id order.
    #[must_use]
    pub fn conversations(&self) -> Vec<Conversation> {
        self.state
            .read()
            .of_kind(EntityKind::Conversation)
            .filter_map(|e| e.as_conversation().cloned())
            .collect()
    }

    /// All artifacts, in id order.
    #[must_use]
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.state
            .read()
            .of_kind(EntityKind::Artifact)
            .filter_map(|e| e.as_artifact().cloned())
            .collect()
    }

    /// The messages of a conversation in the order they were added.
    ///
    /// The iterator is lazy: each message is read when it is reached, so a
    /// message deleted meanwhile is skipped. An unknown conversation yields
    /// nothing.
    #[must_use]
    pub fn list_by_conversation(&self, conversation_id: &str) -> ConversationMessages<'_> {
        let ids: Arc<[String]> = self
            .state
            .read()
            .conversation(conversation_id)
            .map(|c| Arc::from(c.message_ids.as_slice()))
            .unwrap_or_else(|| Arc::from(Vec::new()));
        ConversationMessages {
            store: self,
            ids,
            position: 0,
        }
    }

    /// A metadata slot.
    #[must_use]
    pub fn meta(&self, key: MetaKey) -> Option<i64> {
        self.state.read().meta.get(&key).copied()
    }

    // ---- ledger ---------------------------------------------------------

    /// Pending counts per kind, read from maintained counters.
    #[must_use]
    pub fn pending_counts(&self) -> PendingCounts {
        self.state.read().ledger.pending_counts()
    }

    /// The records the coordinator may submit now, in queue order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingRecord> {
        self.state.read().ledger.snapshot()
    }

    /// The ledger entry of a record.
    #[must_use]
    pub fn ledger_entry(&self, key: &RecordKey) -> Option<LedgerEntry> {
        self.state.read().ledger.entry(key).copied()
    }

    /// A record together with its ledger entry, read under one lock.
    #[must_use]
    pub fn get_tracked(&self, key: &RecordKey) -> Option<(Entity, LedgerEntry)> {
        let state = self.state.read();
        let entity = state.entities.get(key)?.clone();
        let entry = *state.ledger.entry(key)?;
        Some((entity, entry))
    }

    /// The marker on a record.
    #[must_use]
    pub fn marker(&self, key: &RecordKey) -> Option<SyncMarker> {
        self.state.read().ledger.marker(key).cloned()
    }

    /// All markers, ordered by key.
    #[must_use]
    pub fn markers(&self) -> Vec<(RecordKey, SyncMarker)> {
        self.state
            .read()
            .ledger
            .markers()
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect()
    }

    /// Runs `f` against the ledger under the read lock.
    pub fn with_ledger<R>(&self, f: impl FnOnce(&SyncLedger) -> R) -> R {
        f(&self.state.read().ledger)
    }

    // ---- maintenance ----------------------------------------------------

    /// Log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot report its size.
    pub fn log_bytes(&self) -> CoreResult<u64> {
        self.wal.lock().size()
    }

    /// Counters describing the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the log size cannot be read.
    pub fn stats(&self) -> CoreResult<StoreStats> {
        let log_bytes = self.log_bytes()?;
        let state = self.state.read();
        Ok(StoreStats {
            conversations: state.count(EntityKind::Conversation),
            messages: state.count(EntityKind::Message),
            artifacts: state.count(EntityKind::Artifact),
            pending: state.ledger.pending_counts(),
            markers: state.ledger.markers().count(),
            log_bytes,
            last_sequence: state.last_sequence,
        })
    }

    /// Cross-checks entities, ledger counters and conversation membership.
    ///
    /// # Errors
    ///
    /// [`CoreError::Corruption`] describing the first inconsistency.
    pub fn verify(&self) -> CoreResult<()> {
        self.state.read().verify()
    }

    /// Rewrites the log as a single snapshot transaction.
    ///
    /// File-backed stores write the snapshot to a temporary file, sync it
    /// and rename it over the log, so a crash leaves either the old or the
    /// new log. The snapshot gives every record a revision newer than any
    /// issued before it, so an acknowledgment for a revision read before
    /// compaction is reported as [`MarkSyncedOutcome::Superseded`] and the
    /// record is submitted again.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn compact(&self) -> CoreResult<CompactionReport> {
        self.ensure_writable()?;

        let mut wal = self.wal.lock();
        let mut state = self.state.write();

        let bytes_before = wal.size()?;
        let txid = TransactionId::new(state.last_txid.as_u64() + 1);
        let records = state.snapshot_records(txid, state.last_sequence.next())?;

        match &self.dir {
            Some(dir) => {
                {
                    let tmp = FileBackend::create_empty(&dir.compaction_path())?;
                    let mut out = Wal::new(Box::new(tmp), true);
                    out.append_batch(&records)?;
                }
                dir.install_compaction()?;
                match FileBackend::open(&dir.log_path()) {
                    Ok(backend) => wal.replace_backend(Box::new(backend)),
                    Err(err) => {
                        let err = CoreError::from(err);
                        self.poison(&err);
                        return Err(err);
                    }
                }
            }
            None => {
                if let Err(err) = wal.rewrite(&records) {
                    self.poison(&err);
                    return Err(err);
                }
            }
        }

        let (rebuilt, report) = StoreState::replay(&mut wal)?;
        *state = rebuilt;
        self.compacted_bytes
            .store(report.committed_bytes, Ordering::SeqCst);

        tracing::info!(
            bytes_before,
            bytes_after = report.committed_bytes,
            records = records.len(),
            "log compacted"
        );

        Ok(CompactionReport {
            bytes_before,
            bytes_after: report.committed_bytes,
            records: records.len(),
        })
    }

    fn maybe_auto_compact(&self) {
        let threshold = self.config.auto_compact_bytes;
        if threshold == 0 {
            return;
        }
        let Ok(size) = self.log_bytes() else {
            return;
        };
        if size > self.compacted_bytes.load(Ordering::SeqCst) + threshold {
            if let Err(err) = self.compact() {
                tracing::warn!(error = %err, "automatic compaction failed");
            }
        }
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path())
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

/// Lazy, restartable iterator over a conversation's messages.
///
/// Created by [`LocalStore::list_by_conversation`].
#[derive(Clone)]
pub struct ConversationMessages<'a> {
    store: &'a LocalStore,
    ids: Arc<[String]>,
    position: usize,
}

impl ConversationMessages<'_> {
    /// Rewinds to the first message.
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// The message ids this iterator walks.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl Iterator for ConversationMessages<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        while let Some(id) = self.ids.get(self.position) {
            self.position += 1;
            if let Some(message) = self.store.get_message(id) {
                return Some(message);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len().saturating_sub(self.position)))
    }
}

/// A transaction in progress.
///
/// Every mutation is validated, applied to the store state at once (so
/// later reads in the same transaction see it) and queued for the log.
pub struct Transaction<'a> {
    state: &'a mut StoreState,
    txid: TransactionId,
    now: DateTime<Utc>,
    records: Vec<WalRecord>,
    undo: Vec<Undo>,
}

impl<'a> Transaction<'a> {
    fn new(state: &'a mut StoreState, txid: TransactionId, now: DateTime<Utc>) -> Self {
        Self {
            state,
            txid,
            now,
            records: Vec::new(),
            undo: Vec::new(),
        }
    }

    fn into_parts(self) -> (Vec<WalRecord>, Vec<Undo>) {
        (self.records, self.undo)
    }

    /// The transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.txid
    }

    fn push(&mut self, record: WalRecord) -> CoreResult<()> {
        let undo = self.state.apply(&record)?;
        self.undo.push(undo);
        self.records.push(record);
        Ok(())
    }

    fn push_put(&mut self, entity: Entity) -> CoreResult<()> {
        let record = WalRecord::Put {
            txid: self.txid,
            key: entity.key(),
            bytes: encode_entity(&entity)?,
        };
        let undo = self.state.apply_put(entity);
        self.undo.push(undo);
        self.records.push(record);
        Ok(())
    }

    // ---- reads ----------------------------------------------------------

    /// Returns an entity as this transaction sees it.
    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        self.state.get(kind, id)
    }

    /// Returns a conversation as this transaction sees it.
    #[must_use]
    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.state.conversation(id)
    }

    /// The ledger as this transaction sees it.
    #[must_use]
    pub fn ledger(&self) -> &SyncLedger {
        &self.state.ledger
    }

    // ---- writes ---------------------------------------------------------

    /// Inserts or replaces an entity; see [`LocalStore::put`].
    ///
    /// A conversation's `message_ids` belong to the store: on replace the
    /// stored list is kept, and a new conversation must start empty.
    ///
    /// # Errors
    ///
    /// [`CoreError::Integrity`] on a dangling or moved message, or a new
    /// conversation that lists messages.
    pub fn put(&mut self, entity: impl Into<Entity>) -> CoreResult<()> {
        match entity.into() {
            Entity::Message(message) => {
                let (mut owner, _) = self.owner_after_put(&message)?;
                self.push_put(Entity::Message(message))?;
                owner.touch(self.now);
                self.push_put(Entity::Conversation(owner))
            }
            Entity::Conversation(mut conversation) => {
                match self.state.conversation(&conversation.id) {
                    Some(existing) => conversation.message_ids = existing.message_ids.clone(),
                    None if !conversation.message_ids.is_empty() => {
                        return Err(CoreError::integrity(format!(
                            "new conversation {} lists messages that were never written",
                            conversation.id
                        )));
                    }
                    None => {}
                }
                self.push_put(Entity::Conversation(conversation))
            }
            artifact @ Entity::Artifact(_) => self.push_put(artifact),
        }
    }

    /// Validates a message write. Returns its conversation, with the
    /// message appended if it is new, and whether it is new.
    fn owner_after_put(&self, message: &Message) -> CoreResult<(Conversation, bool)> {
        let existing = self.state.message(&message.id);
        if let Some(existing) = existing {
            if existing.conversation_id != message.conversation_id {
                return Err(CoreError::integrity(format!(
                    "message {} belongs to conversation {} and cannot move to {}",
                    message.id, existing.conversation_id, message.conversation_id
                )));
            }
        }
        let is_new = existing.is_none();

        let mut owner = self
            .state
            .conversation(&message.conversation_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::integrity(format!(
                    "message {} references unknown conversation {}",
                    message.id, message.conversation_id
                ))
            })?;
        if is_new {
            owner.message_ids.push(message.id.clone());
        }
        Ok((owner, is_new))
    }

    /// Deletes an entity; a conversation takes its messages with it, a
    /// message is removed from its conversation. Returns false if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is inconsistent.
    pub fn delete(&mut self, kind: EntityKind, id: &str) -> CoreResult<bool> {
        let key = RecordKey::new(kind, id);
        match kind {
            EntityKind::Conversation => {
                let Some(conversation) = self.state.conversation(id).cloned() else {
                    return Ok(false);
                };
                for message_id in &conversation.message_ids {
                    self.push(WalRecord::Delete {
                        txid: self.txid,
                        key: RecordKey::new(EntityKind::Message, message_id),
                    })?;
                }
                self.push(WalRecord::Delete {
                    txid: self.txid,
                    key,
                })?;
            }
            EntityKind::Message => {
                let Some(message) = self.state.message(id).cloned() else {
                    return Ok(false);
                };
                self.push(WalRecord::Delete {
                    txid: self.txid,
                    key,
                })?;
                if let Some(mut owner) = self.state.conversation(&message.conversation_id).cloned()
                {
                    owner.message_ids.retain(|m| m != id);
                    owner.touch(self.now);
                    self.push_put(Entity::Conversation(owner))?;
                }
            }
            EntityKind::Artifact => {
                if self.state.get(kind, id).is_none() {
                    return Ok(false);
                }
                self.push(WalRecord::Delete {
                    txid: self.txid,
                    key,
                })?;
            }
        }
        Ok(true)
    }

    /// Flags a record as pending and clears a conflict or rejection marker.
    /// Idempotent. Returns whether the record was synced before.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownRecord`] if the record does not exist.
    pub fn mark_pending(&mut self, key: &RecordKey) -> CoreResult<bool> {
        let Some(entry) = self.state.ledger.entry(key).copied() else {
            return Err(CoreError::UnknownRecord(key.clone()));
        };
        if self.state.ledger.needs_pending(key) {
            self.push(WalRecord::MarkPending {
                txid: self.txid,
                key: key.clone(),
            })?;
        }
        Ok(entry.synced)
    }

    /// Flags a record as synced; see [`LocalStore::mark_synced`].
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownRecord`] if the record is not tracked.
    pub fn mark_synced(
        &mut self,
        key: &RecordKey,
        revision: Option<u64>,
    ) -> CoreResult<MarkSyncedOutcome> {
        let Some(entry) = self.state.ledger.entry(key).copied() else {
            return Err(CoreError::UnknownRecord(key.clone()));
        };
        if entry.synced {
            return Ok(MarkSyncedOutcome::AlreadySynced);
        }
        let revision = revision.unwrap_or(entry.revision);
        if revision != entry.revision {
            return Ok(MarkSyncedOutcome::Superseded {
                current: entry.revision,
            });
        }
        self.push(WalRecord::MarkSynced {
            txid: self.txid,
            key: key.clone(),
            revision,
        })?;
        Ok(MarkSyncedOutcome::Synced)
    }

    /// Attaches a marker to a tracked record.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownRecord`] if the record is not tracked.
    pub fn set_marker(&mut self, key: &RecordKey, marker: SyncMarker) -> CoreResult<()> {
        if self.state.ledger.entry(key).is_none() {
            return Err(CoreError::UnknownRecord(key.clone()));
        }
        self.push(WalRecord::SetMarker {
            txid: self.txid,
            key: key.clone(),
            marker,
        })
    }

    /// Removes a record's marker. Returns false if there was none.
    ///
    /// # Errors
    ///
    /// Returns an error if the state is inconsistent.
    pub fn clear_marker(&mut self, key: &RecordKey) -> CoreResult<bool> {
        if self.state.ledger.marker(key).is_none() {
            return Ok(false);
        }
        self.push(WalRecord::ClearMarker {
            txid: self.txid,
            key: key.clone(),
        })?;
        Ok(true)
    }

    /// Resolves a conflict in favour of the local copy: the record is made
    /// pending and its next submission overwrites the remote.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownRecord`] if the record is not tracked.
    pub fn resolve_keep_local(&mut self, key: &RecordKey) -> CoreResult<()> {
        self.mark_pending(key)?;
        let marker = SyncMarker::new(MarkerKind::Resolved, "resolved: keep local", self.now);
        self.set_marker(key, marker)
    }

    /// Applies a version of a record fetched from the remote.
    ///
    /// The record is stored as synced unless the local copy is pending:
    /// identical content acknowledges the local copy, different content
    /// leaves it untouched for the caller to flag as a conflict. Remote
    /// messages are linked into their conversation without dirtying it.
    ///
    /// # Errors
    ///
    /// [`CoreError::Integrity`] if a message references an unknown
    /// conversation or moves between conversations.
    pub fn apply_remote(&mut self, entity: impl Into<Entity>) -> CoreResult<RemoteApply> {
        let mut entity = entity.into();
        entity.set_synced(true);
        let key = entity.key();

        if let Some(entry) = self.state.ledger.entry(&key).copied() {
            if !entry.synced {
                if let Some(local) = self.state.entities.get(&key) {
                    if content_digest(local)? == content_digest(&entity)? {
                        self.mark_synced(&key, Some(entry.revision))?;
                        return Ok(RemoteApply::Acknowledged);
                    }
                }
                return Ok(RemoteApply::LocalPending);
            }
        }

        match entity {
            Entity::Message(message) => {
                let (mut owner, is_new) = self.owner_after_put(&message)?;
                let timestamp = message.timestamp;
                self.push_put(Entity::Message(message))?;
                if is_new {
                    if timestamp > owner.updated_at {
                        owner.updated_at = timestamp;
                    }
                    self.push_put(Entity::Conversation(owner))?;
                }
            }
            Entity::Conversation(mut conversation) => {
                conversation.message_ids = self
                    .state
                    .conversation(&conversation.id)
                    .map(|c| c.message_ids.clone())
                    .unwrap_or_default();
                self.push_put(Entity::Conversation(conversation))?;
            }
            artifact @ Entity::Artifact(_) => self.push_put(artifact)?,
        }
        Ok(RemoteApply::Applied)
    }

    /// Sets a metadata slot.
    pub fn set_meta(&mut self, key: MetaKey, value: i64) {
        let record = WalRecord::SetMeta {
            txid: self.txid,
            key,
            value,
        };
        // SetMeta never fails to apply
        if let Ok(undo) = self.state.apply(&record) {
            self.undo.push(undo);
            self.records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn seeded() -> (LocalStore, Conversation) {
        let store = LocalStore::open_in_memory().unwrap();
        let conversation = Conversation::new("Recipes").with_id("c1");
        store.put(conversation.clone()).unwrap();
        (store, conversation)
    }

    fn message(id: &str, conversation: &str) -> Message {
        Message::new(conversation, Role::User, format!("text of {id}")).with_id(id)
    }

    #[test]
    fn put_then_get() {
        let (store, _) = seeded();
        let m = message("m1", "c1");
        store.put(m.clone()).unwrap();

        assert_eq!(store.get_message("m1"), Some(m));
        assert_eq!(store.get(EntityKind::Message, "nope"), None);
    }

    #[test]
    fn message_requires_conversation() {
        let store = LocalStore::open_in_memory().unwrap();
        let err = store.put(message("m1", "ghost")).unwrap_err();
        assert!(matches!(err, CoreError::Integrity { .. }));
        assert_eq!(store.pending_counts().total(), 0);
        assert_eq!(store.log_bytes().unwrap(), 0);
    }

    #[test]
    fn message_cannot_move() {
        let (store, _) = seeded();
        store.put(Conversation::new("Other").with_id("c2")).unwrap();
        store.put(message("m1", "c1")).unwrap();

        let err = store.put(message("m1", "c2")).unwrap_err();
        assert!(matches!(err, CoreError::Integrity { .. }));
        assert_eq!(store.get_message("m1").unwrap().conversation_id, "c1");
    }

    #[test]
    fn new_message_is_linked_and_touches_conversation() {
        let (store, conversation) = seeded();
        store
            .mark_synced(&RecordKey::new(EntityKind::Conversation, "c1"), None)
            .unwrap();

        store.put(message("m1", "c1")).unwrap();
        store.put(message("m1", "c1")).unwrap();

        let stored = store.get_conversation("c1").unwrap();
        assert_eq!(stored.message_ids, vec!["m1".to_string()]);
        assert!(!stored.synced);
        assert!(stored.updated_at >= conversation.updated_at);
    }

    #[test]
    fn conversation_put_keeps_message_list() {
        let (store, _) = seeded();
        store.put(message("m1", "c1")).unwrap();
        store.put(Conversation::new("Renamed").with_id("c1")).unwrap();

        let stored = store.get_conversation("c1").unwrap();
        assert_eq!(stored.title, "Renamed");
        assert_eq!(stored.message_ids, vec!["m1".to_string()]);
    }

    #[test]
    fn list_by_conversation_is_ordered_and_restartable() {
        let (store, _) = seeded();
        for id in ["m3", "m1", "m2"] {
            store.put(message(id, "c1")).unwrap();
        }

        let mut iter = store.list_by_conversation("c1");
        let first: Vec<_> = iter.by_ref().map(|m| m.id).collect();
        assert_eq!(first, vec!["m3", "m1", "m2"]);
        assert_eq!(iter.next(), None);

        iter.restart();
        assert_eq!(iter.clone().count(), 3);
        assert_eq!(store.list_by_conversation("ghost").count(), 0);
    }

    #[test]
    fn cascade_delete() {
        let (store, _) = seeded();
        store.put(message("m1", "c1")).unwrap();
        store.put(message("m2", "c1")).unwrap();
        assert_eq!(store.pending_counts().messages, 2);

        assert!(store.delete(EntityKind::Conversation, "c1").unwrap());
        assert!(store.get_message("m1").is_none());
        assert!(store.get_conversation("c1").is_none());
        assert_eq!(store.pending_counts(), PendingCounts::default());
        assert!(!store.delete(EntityKind::Conversation, "c1").unwrap());
        store.verify().unwrap();
    }

    #[test]
    fn delete_message_unlinks_it() {
        let (store, _) = seeded();
        store.put(message("m1", "c1")).unwrap();
        store.put(message("m2", "c1")).unwrap();

        assert!(store.delete(EntityKind::Message, "m1").unwrap());
        assert_eq!(
            store.get_conversation("c1").unwrap().message_ids,
            vec!["m2".to_string()]
        );
        store.verify().unwrap();
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let (store, _) = seeded();
        let before = store.log_bytes().unwrap();

        let result: CoreResult<()> = store.transaction(|txn| {
            txn.put(Artifact::new(crate::ArtifactType::Text, "note", b"x".to_vec()).with_id("a1"))?;
            assert!(txn.get(EntityKind::Artifact, "a1").is_some());
            Err(CoreError::invalid_operation("abort"))
        });

        assert!(result.is_err());
        assert!(store.get_artifact("a1").is_none());
        assert_eq!(store.pending_counts().artifacts, 0);
        assert_eq!(store.log_bytes().unwrap(), before);
    }

    #[test]
    fn empty_transaction_writes_nothing() {
        let (store, _) = seeded();
        let before = store.log_bytes().unwrap();
        store.transaction(|_| Ok(())).unwrap();
        assert_eq!(store.log_bytes().unwrap(), before);
    }

    #[test]
    fn mark_synced_outcomes() {
        let (store, _) = seeded();
        let key = RecordKey::new(EntityKind::Conversation, "c1");
        let revision = store.ledger_entry(&key).unwrap().revision;

        store.put(Conversation::new("edited").with_id("c1")).unwrap();
        assert_eq!(
            store.mark_synced(&key, Some(revision)).unwrap(),
            MarkSyncedOutcome::Superseded {
                current: revision + 1
            }
        );
        assert_eq!(
            store.mark_synced(&key, Some(revision + 1)).unwrap(),
            MarkSyncedOutcome::Synced
        );
        assert_eq!(
            store.mark_synced(&key, None).unwrap(),
            MarkSyncedOutcome::AlreadySynced
        );
        assert!(store.get_conversation("c1").unwrap().synced);

        let unknown = RecordKey::new(EntityKind::Message, "ghost");
        assert!(matches!(
            store.mark_synced(&unknown, None),
            Err(CoreError::UnknownRecord(_))
        ));
    }

    #[test]
    fn ack_for_deleted_then_recreated_record_is_superseded() {
        let (store, _) = seeded();
        let key = RecordKey::new(EntityKind::Message, "m1");
        let mut first = message("m1", "c1");
        first.content = "version A".into();
        store.put(first).unwrap();
        let in_flight = store.snapshot();
        let acked = in_flight.iter().find(|p| p.key == key).unwrap().revision;

        assert!(store.delete(EntityKind::Message, "m1").unwrap());
        let mut second = message("m1", "c1");
        second.content = "version B".into();
        store.put(second).unwrap();

        let outcome = store.mark_synced(&key, Some(acked)).unwrap();
        assert!(matches!(outcome, MarkSyncedOutcome::Superseded { current } if current > acked));
        let stored = store.get_message("m1").unwrap();
        assert_eq!(stored.content, "version B");
        assert!(!stored.synced);
        assert!(store.snapshot().iter().any(|p| p.key == key));
    }

    #[test]
    fn ack_from_before_compaction_is_superseded() {
        let backend = InMemoryBackend::new();
        let store =
            LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default())
                .unwrap();
        store.put(Conversation::new("a").with_id("c1")).unwrap();
        let key = RecordKey::new(EntityKind::Message, "m1");
        store.put(message("m1", "c1")).unwrap();
        let old = store.ledger_entry(&key).unwrap().revision;
        let mut edited = message("m1", "c1");
        edited.content = "edited".into();
        store.put(edited).unwrap();
        let latest = store.ledger_entry(&key).unwrap().revision;

        store.compact().unwrap();
        let current = store.ledger_entry(&key).unwrap().revision;
        assert!(current > latest);
        for stale in [old, latest] {
            assert_eq!(
                store.mark_synced(&key, Some(stale)).unwrap(),
                MarkSyncedOutcome::Superseded { current }
            );
        }
        assert!(!store.get_message("m1").unwrap().synced);
        drop(store);

        let reopened =
            LocalStore::open_with_backend(Box::new(backend), StoreConfig::default()).unwrap();
        assert_eq!(reopened.ledger_entry(&key).unwrap().revision, current);
        reopened.put(message("m2", "c1")).unwrap();
        let fresh = reopened
            .ledger_entry(&RecordKey::new(EntityKind::Message, "m2"))
            .unwrap()
            .revision;
        assert!(fresh > current);
        assert_eq!(
            reopened.mark_synced(&key, Some(current)).unwrap(),
            MarkSyncedOutcome::Synced
        );
    }

    #[test]
    fn resolve_keeps_local_as_overwrite() {
        let (store, _) = seeded();
        let key = RecordKey::new(EntityKind::Conversation, "c1");
        store
            .transaction(|txn| txn.set_marker(&key, SyncMarker::conflict("remote differs")))
            .unwrap();
        assert!(store.snapshot().is_empty());

        store.transaction(|txn| txn.resolve_keep_local(&key)).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].overwrite);
        assert_eq!(store.marker(&key).unwrap().kind, MarkerKind::Resolved);

        store.mark_synced(&key, None).unwrap();
        assert!(store.marker(&key).is_none());
    }

    #[test]
    fn remote_apply_respects_pending_local() {
        let (store, conversation) = seeded();

        let mut remote = conversation.clone();
        remote.title = "Remote title".into();
        let outcome = store.transaction(|txn| txn.apply_remote(remote)).unwrap();
        assert_eq!(outcome, RemoteApply::LocalPending);
        assert_eq!(store.get_conversation("c1").unwrap().title, "Recipes");

        let outcome = store
            .transaction(|txn| txn.apply_remote(conversation.clone()))
            .unwrap();
        assert_eq!(outcome, RemoteApply::Acknowledged);
        assert_eq!(store.pending_counts().total(), 0);

        let mut remote_message = message("m9", "c1");
        remote_message.synced = true;
        let outcome = store
            .transaction(|txn| txn.apply_remote(remote_message))
            .unwrap();
        assert_eq!(outcome, RemoteApply::Applied);
        let stored = store.get_conversation("c1").unwrap();
        assert_eq!(stored.message_ids, vec!["m9".to_string()]);
        assert!(stored.synced);
        assert_eq!(store.pending_counts().total(), 0);
    }

    #[test]
    fn compaction_preserves_state() {
        let backend = InMemoryBackend::new();
        let store =
            LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default())
                .unwrap();
        store.put(Conversation::new("a").with_id("c1")).unwrap();
        for i in 0..20 {
            store.put(message(&format!("m{i:02}"), "c1")).unwrap();
        }
        store
            .mark_synced(&RecordKey::new(EntityKind::Message, "m00"), None)
            .unwrap();
        store.set_meta(MetaKey::ServerCursor, 42).unwrap();
        let order_before: Vec<_> = store.snapshot().into_iter().map(|p| p.key).collect();

        let report = store.compact().unwrap();
        assert!(report.bytes_after < report.bytes_before);

        let order_after: Vec<_> = store.snapshot().into_iter().map(|p| p.key).collect();
        assert_eq!(order_before, order_after);
        store.put(message("late", "c1")).unwrap();
        drop(store);

        let reopened =
            LocalStore::open_with_backend(Box::new(backend), StoreConfig::default()).unwrap();
        assert_eq!(reopened.pending_counts().messages, 20);
        assert_eq!(reopened.meta(MetaKey::ServerCursor), Some(42));
        assert!(reopened.get_message("m00").unwrap().synced);
        reopened.verify().unwrap();
    }

    #[test]
    fn stats_count_everything() {
        let (store, _) = seeded();
        store.put(message("m1", "c1")).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.pending.total(), 2);
        assert_eq!(stats.last_sequence, SequenceNumber::new(2));
    }
}
