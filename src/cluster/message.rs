//! Invalidation messages and their wire encoding.

use crate::error::Result;
use crate::types::{EntityId, NodeId, Revision};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationKind {
    /// The entity was written and now sits at `revision`.
    Changed { revision: Revision },
    /// The entity was deleted at `revision` (tombstone).
    Deleted { revision: Revision },
}

/// "Entity `id` is now at revision R", broadcast after a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    /// Node that performed the write.
    pub origin: NodeId,
    /// Entity that changed.
    pub id: EntityId,
    /// Change or tombstone.
    pub kind: InvalidationKind,
}

impl InvalidationMessage {
    /// A change notification.
    pub fn changed(origin: NodeId, id: EntityId, revision: Revision) -> Self {
        Self {
            origin,
            id,
            kind: InvalidationKind::Changed { revision },
        }
    }

    /// A deletion notification.
    pub fn deleted(origin: NodeId, id: EntityId, revision: Revision) -> Self {
        Self {
            origin,
            id,
            kind: InvalidationKind::Deleted { revision },
        }
    }

    /// Revision carried by the message.
    pub fn revision(&self) -> Revision {
        match self.kind {
            InvalidationKind::Changed { revision } | InvalidationKind::Deleted { revision } => {
                revision
            }
        }
    }

    /// Whether this is a deletion.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, InvalidationKind::Deleted { .. })
    }

    /// Encode into a transport frame.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode a transport frame.
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_decodes_to_same_message() {
        let message = InvalidationMessage::deleted(3, EntityId::from("session#abc"), 9);
        let frame = message.to_bytes().unwrap();
        let decoded = InvalidationMessage::from_bytes(&frame).unwrap();

        assert_eq!(decoded, message);
        assert!(decoded.is_tombstone());
        assert_eq!(decoded.revision(), 9);
    }

    #[test]
    fn test_garbage_frame_is_codec_error() {
        let err = InvalidationMessage::from_bytes(&[0xff, 0x01]).unwrap_err();
        assert_eq!(err.kind(), "codec");
    }
}
