//! In-memory store state and the single function that mutates it.
//!
//! Live transactions and log replay both go through [`StoreState::apply`],
//! so a reopened store is exactly the state that was acknowledged before.

use crate::codec::decode_entity;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{LedgerEntry, SyncLedger, SyncMarker};
use crate::model::{Conversation, Entity, Message};
use crate::types::{EntityKind, MetaKey, RecordKey, SequenceNumber, TransactionId};
use crate::wal::{Wal, WalRecord};
use std::collections::BTreeMap;

/// Entities, ledger and metadata, as of the last applied record.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) entities: BTreeMap<RecordKey, Entity>,
    pub(crate) ledger: SyncLedger,
    pub(crate) meta: BTreeMap<MetaKey, i64>,
    pub(crate) last_txid: TransactionId,
    pub(crate) last_sequence: SequenceNumber,
}

/// What it takes to put a record or a metadata slot back.
#[derive(Debug)]
pub(crate) enum Undo {
    Nothing,
    Record {
        key: RecordKey,
        entity: Option<Entity>,
        ledger: Option<LedgerEntry>,
        marker: Option<SyncMarker>,
        next_order: u64,
        last_revision: u64,
    },
    Revision(u64),
    Meta {
        key: MetaKey,
        value: Option<i64>,
    },
}

/// Outcome of replaying a log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReplayReport {
    pub(crate) transactions: u64,
    pub(crate) committed_bytes: u64,
    pub(crate) discarded_bytes: u64,
}

impl StoreState {
    pub(crate) fn get(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        self.entities.get(&RecordKey::new(kind, id))
    }

    pub(crate) fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.get(EntityKind::Conversation, id)
            .and_then(Entity::as_conversation)
    }

    pub(crate) fn message(&self, id: &str) -> Option<&Message> {
        self.get(EntityKind::Message, id).and_then(Entity::as_message)
    }

    /// Entities of one kind, in id order.
    pub(crate) fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities
            .range(RecordKey::first_of(kind)..)
            .take_while(move |(key, _)| key.kind == kind)
            .map(|(_, entity)| entity)
    }

    pub(crate) fn count(&self, kind: EntityKind) -> usize {
        self.of_kind(kind).count()
    }

    fn capture(&self, key: &RecordKey) -> Undo {
        Undo::Record {
            key: key.clone(),
            entity: self.entities.get(key).cloned(),
            ledger: self.ledger.entry(key).copied(),
            marker: self.ledger.marker(key).cloned(),
            next_order: self.ledger.next_order(),
            last_revision: self.ledger.last_revision(),
        }
    }

    /// Applies a put of an already-decoded entity.
    pub(crate) fn apply_put(&mut self, entity: Entity) -> Undo {
        let key = entity.key();
        let undo = self.capture(&key);
        let synced = entity.is_synced();
        self.entities.insert(key.clone(), entity);
        self.ledger.record_put(&key, synced);
        undo
    }

    /// Applies one record. `Begin` and `Commit` are bookkeeping for the
    /// caller and change nothing here.
    pub(crate) fn apply(&mut self, record: &WalRecord) -> CoreResult<Undo> {
        let undo = match record {
            WalRecord::Begin { .. } | WalRecord::Commit { .. } => Undo::Nothing,
            WalRecord::Put { key, bytes, .. } => {
                let entity = decode_entity(key.kind, bytes)?;
                if entity.id() != key.id {
                    return Err(CoreError::corruption(format!(
                        "put for {key} carries entity {}",
                        entity.id()
                    )));
                }
                self.apply_put(entity)
            }
            WalRecord::Delete { key, .. } => {
                let undo = self.capture(key);
                self.entities.remove(key);
                self.ledger.forget(key);
                undo
            }
            WalRecord::MarkPending { key, .. } => {
                let undo = self.capture(key);
                if self.ledger.record_pending(key) {
                    if let Some(entity) = self.entities.get_mut(key) {
                        entity.set_synced(false);
                    }
                }
                undo
            }
            WalRecord::MarkSynced { key, revision, .. } => {
                let undo = self.capture(key);
                if self.ledger.record_synced(key, *revision) {
                    if let Some(entity) = self.entities.get_mut(key) {
                        entity.set_synced(true);
                    }
                }
                undo
            }
            WalRecord::SetMarker { key, marker, .. } => {
                let undo = self.capture(key);
                self.ledger.set_marker(key, Some(marker.clone()));
                undo
            }
            WalRecord::ClearMarker { key, .. } => {
                let undo = self.capture(key);
                self.ledger.set_marker(key, None);
                undo
            }
            WalRecord::SetMeta { key, value, .. } => {
                let previous = self.meta.insert(*key, *value);
                Undo::Meta {
                    key: *key,
                    value: previous,
                }
            }
            WalRecord::RevisionFloor { floor, .. } => {
                let previous = self.ledger.last_revision();
                self.ledger.raise_revision_floor(*floor);
                Undo::Revision(previous)
            }
        };
        Ok(undo)
    }

    pub(crate) fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Nothing => {}
            Undo::Record {
                key,
                entity,
                ledger,
                marker,
                next_order,
                last_revision,
            } => {
                match entity {
                    Some(entity) => {
                        self.entities.insert(key.clone(), entity);
                    }
                    None => {
                        self.entities.remove(&key);
                    }
                }
                self.ledger.set_entry(&key, ledger);
                self.ledger.set_marker(&key, marker);
                self.ledger.set_next_order(next_order);
                self.ledger.set_last_revision(last_revision);
            }
            Undo::Revision(previous) => self.ledger.set_last_revision(previous),
            Undo::Meta { key, value } => match value {
                Some(value) => {
                    self.meta.insert(key, value);
                }
                None => {
                    self.meta.remove(&key);
                }
            },
        }
    }

    /// Reverts a transaction's undo log, newest first.
    pub(crate) fn revert_all(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            self.revert(entry);
        }
    }

    /// Rebuilds state from a log.
    ///
    /// Records are buffered per transaction and applied only when their
    /// `Commit` is read. A torn or uncommitted tail is truncated away.
    /// Anything else that does not parse, or a commit whose counters do not
    /// match the replayed ledger, fails the open.
    pub(crate) fn replay(wal: &mut Wal) -> CoreResult<(Self, ReplayReport)> {
        let mut state = Self::default();
        let mut report = ReplayReport::default();
        let mut open: Option<(TransactionId, Vec<WalRecord>)> = None;

        for entry in wal.iter()? {
            let entry = entry?;
            match entry.record {
                WalRecord::Begin { txid } => {
                    if let Some((pending, _)) = &open {
                        return Err(CoreError::corruption(format!(
                            "{txid} begins at offset {} inside uncommitted {pending}",
                            entry.offset
                        )));
                    }
                    open = Some((txid, Vec::new()));
                }
                WalRecord::Commit {
                    txid,
                    sequence,
                    counts,
                } => {
                    let Some((begun, records)) = open.take() else {
                        return Err(CoreError::corruption(format!(
                            "commit of {txid} at offset {} without begin",
                            entry.offset
                        )));
                    };
                    if begun != txid {
                        return Err(CoreError::corruption(format!(
                            "commit of {txid} closes {begun}"
                        )));
                    }
                    for record in &records {
                        state.apply(record).map_err(|err| match err {
                            CoreError::Codec { message } => CoreError::corruption(message),
                            other => other,
                        })?;
                    }
                    let replayed = state.ledger.pending_counts();
                    if replayed != counts {
                        return Err(CoreError::corruption(format!(
                            "pending counters drifted at {sequence}: log has {counts:?}, replay produced {replayed:?}"
                        )));
                    }
                    state.last_txid = txid;
                    state.last_sequence = sequence;
                    report.transactions += 1;
                    report.committed_bytes = entry.end();
                }
                record => match open.as_mut() {
                    Some((begun, records)) if record.txid() == *begun => records.push(record),
                    _ => {
                        return Err(CoreError::corruption(format!(
                            "{:?} record at offset {} outside its transaction",
                            record.record_type(),
                            entry.offset
                        )))
                    }
                },
            }
        }

        let size = wal.size()?;
        if size > report.committed_bytes {
            report.discarded_bytes = size - report.committed_bytes;
            tracing::warn!(
                discarded = report.discarded_bytes,
                offset = report.committed_bytes,
                "discarding unacknowledged log tail"
            );
            wal.truncate(report.committed_bytes)?;
        }

        Ok((state, report))
    }

    /// The records of a log holding exactly this state, as one transaction.
    ///
    /// Pending puts are written in queue order so the upload order survives.
    /// The snapshot opens with the revision counter, so every revision
    /// assigned while replaying it is newer than any issued before.
    pub(crate) fn snapshot_records(
        &self,
        txid: TransactionId,
        sequence: SequenceNumber,
    ) -> CoreResult<Vec<WalRecord>> {
        let mut records = Vec::with_capacity(self.entities.len() + self.meta.len() + 3);
        records.push(WalRecord::Begin { txid });
        records.push(WalRecord::RevisionFloor {
            txid,
            floor: self.ledger.last_revision(),
        });

        for (key, value) in &self.meta {
            records.push(WalRecord::SetMeta {
                txid,
                key: *key,
                value: *value,
            });
        }

        let put = |entity: &Entity| -> CoreResult<WalRecord> {
            Ok(WalRecord::Put {
                txid,
                key: entity.key(),
                bytes: crate::codec::encode_entity(entity)?,
            })
        };

        for entity in self.entities.values().filter(|e| e.is_synced()) {
            records.push(put(entity)?);
        }
        for key in self.ledger.pending() {
            if let Some(entity) = self.entities.get(key) {
                records.push(put(entity)?);
            }
        }
        for (key, marker) in self.ledger.markers() {
            records.push(WalRecord::SetMarker {
                txid,
                key: key.clone(),
                marker: marker.clone(),
            });
        }

        records.push(WalRecord::Commit {
            txid,
            sequence,
            counts: self.ledger.pending_counts(),
        });
        Ok(records)
    }

    /// Cross-checks entities, ledger and conversation membership.
    pub(crate) fn verify(&self) -> CoreResult<()> {
        if self.ledger.recount() != self.ledger.pending_counts() {
            return Err(CoreError::corruption(format!(
                "pending counters {:?} disagree with ledger entries {:?}",
                self.ledger.pending_counts(),
                self.ledger.recount()
            )));
        }
        if !self.ledger.queue_consistent() {
            return Err(CoreError::corruption("upload queue disagrees with ledger"));
        }
        if self.ledger.len() != self.entities.len() {
            return Err(CoreError::corruption(format!(
                "{} entities but {} ledger entries",
                self.entities.len(),
                self.ledger.len()
            )));
        }

        for (key, entity) in &self.entities {
            let entry = self
                .ledger
                .entry(key)
                .ok_or_else(|| CoreError::corruption(format!("{key} is not tracked")))?;
            if entry.synced != entity.is_synced() {
                return Err(CoreError::corruption(format!(
                    "{key} sync flag disagrees with ledger"
                )));
            }

            match entity {
                Entity::Message(message) => {
                    let owner = self.conversation(&message.conversation_id).ok_or_else(|| {
                        CoreError::corruption(format!(
                            "{key} references missing conversation {}",
                            message.conversation_id
                        ))
                    })?;
                    if !owner.message_ids.contains(&message.id) {
                        return Err(CoreError::corruption(format!(
                            "{key} is not listed by conversation {}",
                            owner.id
                        )));
                    }
                }
                Entity::Conversation(conversation) => {
                    for id in &conversation.message_ids {
                        let listed = self.message(id).ok_or_else(|| {
                            CoreError::corruption(format!("{key} lists missing message {id}"))
                        })?;
                        if listed.conversation_id != conversation.id {
                            return Err(CoreError::corruption(format!(
                                "{key} lists message {id} of conversation {}",
                                listed.conversation_id
                            )));
                        }
                    }
                }
                Entity::Artifact(_) => {}
            }
        }

        for (key, _) in self.ledger.markers() {
            if self.ledger.entry(key).is_none() {
                return Err(CoreError::corruption(format!("marker on untracked {key}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn conversation(id: &str) -> Entity {
        Entity::Conversation(Conversation::new("t").with_id(id))
    }

    #[test]
    fn revert_restores_previous_put() {
        let mut state = StoreState::default();
        state.apply_put(conversation("c1"));
        let before_counts = state.ledger.pending_counts();

        let mut edited = Conversation::new("edited").with_id("c1");
        edited.synced = true;
        let undo = state.apply_put(Entity::Conversation(edited));
        assert_eq!(state.ledger.pending_counts().conversations, 0);

        state.revert(undo);
        assert_eq!(state.conversation("c1").unwrap().title, "t");
        assert_eq!(state.ledger.pending_counts(), before_counts);
        assert!(state.ledger.queue_consistent());
    }

    #[test]
    fn revert_of_insert_removes_it() {
        let mut state = StoreState::default();
        let undo = state.apply_put(conversation("c1"));
        state.revert_all(vec![undo]);

        assert!(state.entities.is_empty());
        assert!(state.ledger.is_empty());
        assert_eq!(state.ledger.next_order(), 0);
    }

    #[test]
    fn verify_catches_orphan_message() {
        let mut state = StoreState::default();
        state.apply_put(Entity::Message(
            Message::new("missing", Role::User, "hi").with_id("m1"),
        ));
        assert!(matches!(state.verify(), Err(CoreError::Corruption { .. })));
    }

    #[test]
    fn of_kind_scans_one_kind() {
        let mut state = StoreState::default();
        state.apply_put(conversation("c2"));
        state.apply_put(conversation("c1"));
        let mut c = Conversation::new("x").with_id("c1");
        c.message_ids.push("m1".into());
        state.apply_put(Entity::Conversation(c));
        state.apply_put(Entity::Message(
            Message::new("c1", Role::User, "hi").with_id("m1"),
        ));

        let ids: Vec<_> = state
            .of_kind(EntityKind::Conversation)
            .map(Entity::id)
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
        assert_eq!(state.count(EntityKind::Message), 1);
        state.verify().unwrap();
    }
}
