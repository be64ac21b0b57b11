//! Invalidation events observed by a node.

use crate::types::{EntityId, NodeId, Revision};

/// Outcome of handling one delivered invalidation, or a resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// The message moved the node forward: the revision was news, or an
    /// older local entry was dropped.
    Applied {
        /// The receiving node.
        node_id: NodeId,
        /// The entity.
        id: EntityId,
        /// Revision from the message.
        revision: Revision,
        /// Whether a local entry was removed.
        evicted: bool,
    },

    /// A deletion was recorded as a negative entry.
    Tombstoned {
        /// The receiving node.
        node_id: NodeId,
        /// The entity.
        id: EntityId,
        /// Revision of the deletion.
        revision: Revision,
    },

    /// Duplicate or reordered message; nothing changed.
    Ignored {
        /// The receiving node.
        node_id: NodeId,
        /// The entity.
        id: EntityId,
        /// Revision from the message.
        revision: Revision,
        /// Highest revision the node already knew.
        known: Option<Revision>,
    },

    /// Messages were lost; the node dropped its whole local state.
    Resynced {
        /// The receiving node.
        node_id: NodeId,
        /// Number of frames the node missed.
        missed: u64,
    },
}

impl InvalidationEvent {
    /// Get the node ID associated with this event.
    pub fn node_id(&self) -> NodeId {
        match self {
            InvalidationEvent::Applied { node_id, .. } => *node_id,
            InvalidationEvent::Tombstoned { node_id, .. } => *node_id,
            InvalidationEvent::Ignored { node_id, .. } => *node_id,
            InvalidationEvent::Resynced { node_id, .. } => *node_id,
        }
    }

    /// The entity, if the event concerns one.
    pub fn id(&self) -> Option<&EntityId> {
        match self {
            InvalidationEvent::Applied { id, .. }
            | InvalidationEvent::Tombstoned { id, .. }
            | InvalidationEvent::Ignored { id, .. } => Some(id),
            InvalidationEvent::Resynced { .. } => None,
        }
    }

    /// Whether the event changed local state.
    pub fn is_effective(&self) -> bool {
        !matches!(self, InvalidationEvent::Ignored { .. })
    }
}

/// Listener for invalidation events.
pub trait InvalidationListener: Send + Sync + 'static {
    /// Called after each delivered message is handled.
    fn on_event(&self, event: InvalidationEvent);
}

/// No-op event listener.
pub struct NoopInvalidationListener;

impl InvalidationListener for NoopInvalidationListener {
    fn on_event(&self, _event: InvalidationEvent) {}
}

/// Event listener that logs events.
pub struct LoggingInvalidationListener;

impl InvalidationListener for LoggingInvalidationListener {
    fn on_event(&self, event: InvalidationEvent) {
        match &event {
            InvalidationEvent::Applied {
                node_id,
                id,
                revision,
                evicted,
            } => {
                tracing::debug!(node_id, %id, revision, evicted, "Invalidation applied");
            }
            InvalidationEvent::Tombstoned {
                node_id,
                id,
                revision,
            } => {
                tracing::debug!(node_id, %id, revision, "Tombstone recorded");
            }
            InvalidationEvent::Ignored {
                node_id,
                id,
                revision,
                known,
            } => {
                tracing::trace!(node_id, %id, revision, ?known, "Invalidation ignored");
            }
            InvalidationEvent::Resynced { node_id, missed } => {
                tracing::warn!(node_id, missed, "Invalidations lost, local state dropped");
            }
        }
    }
}
