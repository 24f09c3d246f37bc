//! CBOR encoding of entities.
//!
//! Entity payloads in the log are CBOR documents of the model structs. The
//! record kind is stored in the log framing, so the payload itself carries
//! no tag.

use crate::error::{CoreError, CoreResult};
use crate::model::{Artifact, Conversation, Entity, Message};
use crate::types::EntityKind;
use sha2::{Digest, Sha256};

/// Encodes an entity to CBOR bytes.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if serialization fails.
pub fn encode_entity(entity: &Entity) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    let result = match entity {
        Entity::Conversation(c) => ciborium::into_writer(c, &mut buf),
        Entity::Message(m) => ciborium::into_writer(m, &mut buf),
        Entity::Artifact(a) => ciborium::into_writer(a, &mut buf),
    };
    result.map_err(|e| CoreError::codec(format!("cannot encode {}: {e:?}", entity.key())))?;
    Ok(buf)
}

/// Decodes an entity of `kind` from CBOR bytes.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if the bytes are not a valid `kind` payload.
pub fn decode_entity(kind: EntityKind, bytes: &[u8]) -> CoreResult<Entity> {
    let decoded = match kind {
        EntityKind::Conversation => {
            ciborium::from_reader::<Conversation, _>(bytes).map(Entity::Conversation)
        }
        EntityKind::Message => ciborium::from_reader::<Message, _>(bytes).map(Entity::Message),
        EntityKind::Artifact => ciborium::from_reader::<Artifact, _>(bytes).map(Entity::Artifact),
    };
    decoded.map_err(|e| CoreError::codec(format!("cannot decode {kind}: {e:?}")))
}

/// SHA-256 over the entity's content, independent of its sync flag.
///
/// The remote compares digests to tell a replay of the same record apart
/// from a genuinely different version.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if the entity cannot be encoded.
pub fn content_digest(entity: &Entity) -> CoreResult<[u8; 32]> {
    let mut normalized = entity.clone();
    normalized.set_synced(false);
    let bytes = encode_entity(&normalized)?;
    Ok(Sha256::digest(&bytes).into())
}
