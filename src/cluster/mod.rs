//! Cluster-wide invalidation.
//!
//! Every write ends with an [`InvalidationMessage`] on the bus so peers can
//! evict their copy right away instead of waiting for the lazy revision check.
//! Delivery is best-effort and may duplicate or reorder; handlers must be
//! idempotent.

mod events;
mod local;
mod message;

pub use events::{
    InvalidationEvent, InvalidationListener, LoggingInvalidationListener,
    NoopInvalidationListener,
};
pub use local::LocalBus;
pub use message::{InvalidationKind, InvalidationMessage};

use crate::error::Result;
use crate::types::NodeId;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receives messages delivered to one node.
#[async_trait]
pub trait InvalidationHandler: Send + Sync + 'static {
    /// Handle one message from a peer.
    async fn on_invalidation(&self, message: InvalidationMessage);

    /// The transport dropped `missed` frames for this node.
    async fn on_lagged(&self, missed: u64);
}

/// Decides whether a frame from `from` reaches `to`.
///
/// Installed on a transport to simulate loss and partitions.
pub trait DeliveryFilter: Send + Sync + std::fmt::Debug + 'static {
    /// Return `false` to drop the message.
    fn should_deliver(&self, from: NodeId, to: NodeId) -> bool;
}

/// Publish/subscribe channel between cluster nodes.
pub trait InvalidationBus: Send + Sync + std::fmt::Debug {
    /// Broadcast a message. Never waits for delivery.
    fn publish(&self, message: &InvalidationMessage) -> Result<()>;

    /// Start delivering peers' messages to `handler` on behalf of `node_id`.
    ///
    /// Messages published by `node_id` itself are not delivered back.
    fn subscribe(
        &self,
        node_id: NodeId,
        handler: Arc<dyn InvalidationHandler>,
    ) -> Result<Subscription>;
}

/// A running delivery task for one node.
///
/// Delivery stops on [`unsubscribe`](Self::unsubscribe) or when dropped.
#[derive(Debug)]
pub struct Subscription {
    node_id: NodeId,
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(node_id: NodeId, shutdown_tx: mpsc::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            node_id,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// The subscribed node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Whether the delivery task is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop delivery and wait for the task to finish.
    pub async fn unsubscribe(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(node_id = self.node_id, "Unsubscribed from invalidation bus");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
