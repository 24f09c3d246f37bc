//! Artifacts produced alongside conversations.

use super::metadata::MetadataMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Artifact payload kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactType {
    /// Encoded image bytes.
    Image,
    /// A document file.
    Document,
    /// Source code.
    Code,
    /// Plain text.
    Text,
}

/// A standalone artifact; not owned by any conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique id.
    pub id: String,
    /// Payload kind.
    pub artifact_type: ArtifactType,
    /// Display title.
    pub title: String,
    /// Opaque payload; the format follows `artifact_type`.
    pub content: Vec<u8>,
    /// Free-form metadata.
    pub metadata: MetadataMap,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// `false` while the remote has not acknowledged this revision.
    pub synced: bool,
}

impl Artifact {
    /// Creates a pending artifact with a fresh id.
    pub fn new(artifact_type: ArtifactType, title: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            artifact_type,
            title: title.into(),
            content,
            metadata: MetadataMap::new(),
            created_at: Utc::now(),
            synced: false,
        }
    }

    /// Replaces the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<super::MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
