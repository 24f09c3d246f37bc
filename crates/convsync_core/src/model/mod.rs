//! Entities persisted by the local store.

mod artifact;
mod conversation;
mod entity;
mod message;
mod metadata;

pub use artifact::{Artifact, ArtifactType};
pub use conversation::Conversation;
pub use entity::Entity;
pub use message::{Message, MessageMetadata, Role};
pub use metadata::{MetadataMap, MetadataValue};
