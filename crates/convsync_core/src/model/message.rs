//! Chat messages.

use super::metadata::MetadataMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The person using the app.
    User,
    /// The assistant.
    Assistant,
}

/// Optional details recorded with a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Model that produced the message.
    pub model: Option<String>,
    /// Tokens consumed.
    pub token_count: Option<u32>,
    /// Time to produce the response, in milliseconds.
    pub latency_ms: Option<u64>,
    /// Anything else.
    pub extra: MetadataMap,
}

/// A single turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id.
    pub id: String,
    /// Message text.
    pub content: String,
    /// Author role.
    pub role: Role,
    /// When the turn was produced.
    pub timestamp: DateTime<Utc>,
    /// Owning conversation.
    pub conversation_id: String,
    /// `false` while the remote has not acknowledged this revision.
    pub synced: bool,
    /// Optional details.
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    /// Creates a pending message with a fresh id, stamped now.
    pub fn new(conversation_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            role,
            timestamp: Utc::now(),
            conversation_id: conversation_id.into(),
            synced: false,
            metadata: None,
        }
    }

    /// Replaces the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attaches metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// True if everything but the sync flag matches `other`.
    pub fn same_content(&self, other: &Message) -> bool {
        self.id == other.id
            && self.content == other.content
            && self.role == other.role
            && self.timestamp == other.timestamp
            && self.conversation_id == other.conversation_id
            && self.metadata == other.metadata
    }
}
