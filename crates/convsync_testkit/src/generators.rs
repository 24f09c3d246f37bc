//! Property-based test generators using proptest.
//!
//! Ids are drawn from small pools so generated operation sequences keep
//! hitting the same records: re-saves, saves after acknowledgment, deletes
//! of records with pending edits.

use crate::fixtures::{epoch, sample_conversation};
use chrono::Duration;
use convsync_core::{
    CoreError, CoreResult, EntityKind, LocalStore, MarkSyncedOutcome, Message, RecordKey, Role,
};
use proptest::prelude::*;

/// Conversation ids in play.
pub const CONVERSATION_POOL: usize = 3;

/// Message ids in play.
pub const MESSAGE_POOL: usize = 8;

/// One store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Save (create or edit) a conversation.
    SaveConversation(usize),
    /// Save a message into a conversation.
    SaveMessage {
        /// Message pool index.
        message: usize,
        /// Conversation pool index.
        conversation: usize,
        /// Message text.
        content: String,
    },
    /// Acknowledge a record at its current revision.
    MarkSynced(EntityKind, usize),
    /// Acknowledge a record at an older revision.
    MarkSyncedStale(EntityKind, usize),
    /// Flag a record as pending.
    MarkPending(EntityKind, usize),
    /// Delete a record.
    Delete(EntityKind, usize),
}

/// Id of the `index`-th conversation of the pool.
pub fn conversation_id(index: usize) -> String {
    format!("c{index}")
}

/// Id of the `index`-th message of the pool.
pub fn message_id(index: usize) -> String {
    format!("m{index}")
}

fn pooled_key(kind: EntityKind, index: usize) -> RecordKey {
    match kind {
        EntityKind::Message => RecordKey::new(kind, message_id(index)),
        _ => RecordKey::new(kind, conversation_id(index)),
    }
}

/// Strategy for message text, including non-ASCII.
pub fn content_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 àé漢字💬]{0,40}").expect("Invalid regex")
}

fn kind_strategy() -> impl Strategy<Value = (EntityKind, usize)> {
    prop_oneof![
        (0..CONVERSATION_POOL).prop_map(|i| (EntityKind::Conversation, i)),
        (0..MESSAGE_POOL).prop_map(|i| (EntityKind::Message, i)),
    ]
}

/// Strategy for a single store operation.
pub fn store_op_strategy() -> impl Strategy<Value = StoreOp> {
    prop_oneof![
        2 => (0..CONVERSATION_POOL).prop_map(StoreOp::SaveConversation),
        4 => (0..MESSAGE_POOL, 0..CONVERSATION_POOL, content_strategy()).prop_map(
            |(message, conversation, content)| StoreOp::SaveMessage {
                message,
                conversation,
                content,
            }
        ),
        3 => kind_strategy().prop_map(|(k, i)| StoreOp::MarkSynced(k, i)),
        1 => kind_strategy().prop_map(|(k, i)| StoreOp::MarkSyncedStale(k, i)),
        1 => kind_strategy().prop_map(|(k, i)| StoreOp::MarkPending(k, i)),
        1 => kind_strategy().prop_map(|(k, i)| StoreOp::Delete(k, i)),
    ]
}

/// Strategy for an operation sequence.
pub fn store_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<StoreOp>> {
    prop::collection::vec(store_op_strategy(), 1..max_len)
}

/// Applies `op` to `store`.
///
/// Expected refusals (integrity violations, unknown records) are returned
/// as `Ok(false)`; any other error is returned as is.
pub fn apply_op(store: &LocalStore, op: &StoreOp) -> CoreResult<bool> {
    let result = match op {
        StoreOp::SaveConversation(index) => {
            let id = conversation_id(*index);
            let mut conversation = sample_conversation(&id);
            if let Some(existing) = store.get_conversation(&id) {
                conversation.title = format!("{} (edited)", existing.title);
            }
            store.put(conversation).map(|()| true)
        }
        StoreOp::SaveMessage {
            message,
            conversation,
            content,
        } => {
            let message = Message::new(conversation_id(*conversation), Role::User, content.clone())
                .with_id(message_id(*message))
                .with_timestamp(epoch() + Duration::seconds(*conversation as i64));
            store.put(message).map(|()| true)
        }
        StoreOp::MarkSynced(kind, index) => store
            .mark_synced(&pooled_key(*kind, *index), None)
            .map(|outcome| outcome == MarkSyncedOutcome::Synced),
        StoreOp::MarkSyncedStale(kind, index) => {
            let key = pooled_key(*kind, *index);
            let stale = store
                .ledger_entry(&key)
                .map_or(0, |entry| entry.revision.saturating_sub(1));
            store
                .mark_synced(&key, Some(stale))
                .map(|outcome| outcome == MarkSyncedOutcome::Synced)
        }
        StoreOp::MarkPending(kind, index) => store.mark_pending(&pooled_key(*kind, *index)),
        StoreOp::Delete(kind, index) => {
            let key = pooled_key(*kind, *index);
            store.delete(key.kind, &key.id)
        }
    };

    match result {
        Ok(changed) => Ok(changed),
        Err(CoreError::Integrity { .. } | CoreError::UnknownRecord(_)) => Ok(false),
        Err(err) => Err(err),
    }
}
