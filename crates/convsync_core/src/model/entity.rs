//! The entity sum type the store persists.

use super::{Artifact, Conversation, Message};
use crate::types::{EntityKind, RecordKey};

/// Any persisted entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    /// A conversation.
    Conversation(Conversation),
    /// A message.
    Message(Message),
    /// An artifact.
    Artifact(Artifact),
}

impl Entity {
    /// Returns the entity kind.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Conversation(_) => EntityKind::Conversation,
            Self::Message(_) => EntityKind::Message,
            Self::Artifact(_) => EntityKind::Artifact,
        }
    }

    /// Returns the entity id.
    pub fn id(&self) -> &str {
        match self {
            Self::Conversation(c) => &c.id,
            Self::Message(m) => &m.id,
            Self::Artifact(a) => &a.id,
        }
    }

    /// Returns the record key.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind(), self.id())
    }

    /// Returns the sync flag.
    pub fn is_synced(&self) -> bool {
        match self {
            Self::Conversation(c) => c.synced,
            Self::Message(m) => m.synced,
            Self::Artifact(a) => a.synced,
        }
    }

    /// Sets the sync flag.
    pub fn set_synced(&mut self, synced: bool) {
        match self {
            Self::Conversation(c) => c.synced = synced,
            Self::Message(m) => m.synced = synced,
            Self::Artifact(a) => a.synced = synced,
        }
    }

    /// Returns the message, if this is one.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the conversation, if this is one.
    pub fn as_conversation(&self) -> Option<&Conversation> {
        match self {
            Self::Conversation(c) => Some(c),
            _ => None,
        }
    }

    /// Returns the artifact, if this is one.
    pub fn as_artifact(&self) -> Option<&Artifact> {
        match self {
            Self::Artifact(a) => Some(a),
            _ => None,
        }
    }

    /// Converts into a message, if this is one.
    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Message(m) => Some(m),
            _ => None,
        }
    }

    /// Converts into a conversation, if this is one.
    pub fn into_conversation(self) -> Option<Conversation> {
        match self {
            Self::Conversation(c) => Some(c),
            _ => None,
        }
    }

    /// Converts into an artifact, if this is one.
    pub fn into_artifact(self) -> Option<Artifact> {
        match self {
            Self::Artifact(a) => Some(a),
            _ => None,
        }
    }
}

impl From<Conversation> for Entity {
    fn from(value: Conversation) -> Self {
        Self::Conversation(value)
    }
}

impl From<Message> for Entity {
    fn from(value: Message) -> Self {
        Self::Message(value)
    }
}

impl From<Artifact> for Entity {
    fn from(value: Artifact) -> Self {
        Self::Artifact(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ArtifactType, Role};

    #[test]
    fn key_and_flag_accessors() {
        let mut e = Entity::from(Message::new("c", Role::User, "x").with_id("m"));
        assert_eq!(e.key(), RecordKey::new(EntityKind::Message, "m"));
        assert!(!e.is_synced());
        e.set_synced(true);
        assert!(e.is_synced());
        assert!(e.as_message().is_some());
        assert!(e.as_artifact().is_none());
    }

    #[test]
    fn conversions() {
        let a = Artifact::new(ArtifactType::Code, "snippet", b"fn main() {}".to_vec()).with_id("a");
        let e = Entity::from(a.clone());
        assert_eq!(e.kind(), EntityKind::Artifact);
        assert_eq!(e.into_artifact(), Some(a));
    }
}
