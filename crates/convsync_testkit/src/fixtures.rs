//! Store fixtures and sample data.

use chrono::{DateTime, Duration, Utc};
use convsync_core::{
    Artifact, ArtifactType, Conversation, LocalStore, Message, MessageMetadata, Role, StoreConfig,
};
use convsync_storage::InMemoryBackend;
use tempfile::TempDir;

/// A store that can be closed and reopened on the same bytes.
pub struct TestStore {
    /// The store instance.
    pub store: LocalStore,
    backend: InMemoryBackend,
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// A store over an in-memory log.
    pub fn memory() -> Self {
        let backend = InMemoryBackend::new();
        let store = LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default())
            .expect("failed to open in-memory store");
        Self {
            store,
            backend,
            temp_dir: None,
        }
    }

    /// A store in a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let store = LocalStore::open(temp_dir.path(), StoreConfig::default())
            .expect("failed to open file store");
        Self {
            store,
            backend: InMemoryBackend::new(),
            temp_dir: Some(temp_dir),
        }
    }

    /// Closes the store and opens it again, as after a process restart.
    pub fn reopen(self) -> Self {
        let Self {
            store,
            backend,
            temp_dir,
        } = self;
        drop(store);

        let store = match &temp_dir {
            Some(dir) => LocalStore::open(dir.path(), StoreConfig::default()),
            None => {
                LocalStore::open_with_backend(Box::new(backend.clone()), StoreConfig::default())
            }
        }
        .expect("failed to reopen store");

        Self {
            store,
            backend,
            temp_dir,
        }
    }

    /// The raw log bytes.
    pub fn raw_log(&self) -> Vec<u8> {
        match &self.temp_dir {
            Some(dir) => std::fs::read(dir.path().join("store.log")).unwrap_or_default(),
            None => self.backend.data(),
        }
    }
}

impl std::ops::Deref for TestStore {
    type Target = LocalStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// A fixed instant, so fixtures are reproducible.
pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

/// A conversation with a stable id.
pub fn sample_conversation(id: &str) -> Conversation {
    let mut conversation = Conversation::new(format!("Conversation {id}")).with_id(id);
    conversation.created_at = epoch();
    conversation.updated_at = epoch();
    conversation
}

/// The `index`-th message of a conversation, alternating roles.
pub fn sample_message(conversation_id: &str, index: usize) -> Message {
    let role = if index % 2 == 0 {
        Role::User
    } else {
        Role::Assistant
    };
    let mut message = Message::new(conversation_id, role, format!("message {index}"))
        .with_id(format!("{conversation_id}-m{index}"))
        .with_timestamp(epoch() + Duration::seconds(index as i64));
    if role == Role::Assistant {
        message = message.with_metadata(MessageMetadata {
            model: Some("gpt-test".into()),
            token_count: Some(12),
            latency_ms: Some(340),
            ..MessageMetadata::default()
        });
    }
    message
}

/// A small text artifact.
pub fn sample_artifact(id: &str) -> Artifact {
    Artifact::new(ArtifactType::Code, format!("snippet {id}"), b"fn main() {}".to_vec())
        .with_id(id)
        .with_metadata("language", "rust")
}

/// Writes a conversation and `messages` messages; returns the messages.
pub fn seed_conversation(store: &LocalStore, id: &str, messages: usize) -> Vec<Message> {
    store
        .put(sample_conversation(id))
        .expect("failed to seed conversation");
    (0..messages)
        .map(|i| {
            let message = sample_message(id, i);
            store.put(message.clone()).expect("failed to seed message");
            message
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_survives_reopen() {
        let store = TestStore::memory();
        seed_conversation(&store, "c1", 2);
        let store = store.reopen();
        assert_eq!(store.list_by_conversation("c1").count(), 2);
        assert!(!store.raw_log().is_empty());
    }

    #[test]
    fn file_store_survives_reopen() {
        let store = TestStore::file();
        seed_conversation(&store, "c1", 3);
        let store = store.reopen();
        assert_eq!(store.pending_counts().messages, 3);
    }
}
