//! Conversations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A conversation and the ordered ids of the messages it owns.
///
/// `message_ids` is maintained by the store: a new message id is appended
/// when the message is first written, removed when it is deleted, and never
/// reordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique id.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Message ids in conversational order.
    pub message_ids: Vec<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Bumped on every mutation of the conversation or its messages.
    pub updated_at: DateTime<Utc>,
    /// `false` while the remote has not acknowledged this revision.
    pub synced: bool,
    /// Opaque reference to an assistant personality.
    pub personality_id: Option<String>,
}

impl Conversation {
    /// Creates an empty pending conversation with a fresh id.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            message_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            synced: false,
            personality_id: None,
        }
    }

    /// Replaces the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the personality reference.
    #[must_use]
    pub fn with_personality(mut self, personality_id: impl Into<String>) -> Self {
        self.personality_id = Some(personality_id.into());
        self
    }

    /// Number of messages in the conversation.
    pub fn len(&self) -> usize {
        self.message_ids.len()
    }

    /// True if the conversation has no messages.
    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
        self.synced = false;
    }
}
