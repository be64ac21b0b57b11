//! In-process invalidation transport.
//!
//! All nodes of a cluster that live in one process share a single
//! [`LocalBus`]. Frames travel over a `tokio::sync::broadcast` channel, so a
//! subscriber that falls more than `capacity` frames behind loses the oldest
//! ones and is told so through [`InvalidationHandler::on_lagged`].

use super::{DeliveryFilter, InvalidationBus, InvalidationHandler, InvalidationMessage, Subscription};
use crate::error::{BusError, Result};
use crate::types::NodeId;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

type SharedFilter = Arc<RwLock<Option<Arc<dyn DeliveryFilter>>>>;

/// Broadcast-channel bus shared by co-located nodes.
#[derive(Debug)]
pub struct LocalBus {
    sender: RwLock<Option<broadcast::Sender<Bytes>>>,
    filter: SharedFilter,
    published: AtomicU64,
}

impl LocalBus {
    /// Frames buffered per subscriber by [`LocalBus::default`].
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a bus buffering up to `capacity` frames per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: RwLock::new(Some(sender)),
            filter: Arc::new(RwLock::new(None)),
            published: AtomicU64::new(0),
        }
    }

    /// Route every delivery through `filter`.
    pub fn set_filter(&self, filter: Arc<dyn DeliveryFilter>) {
        *self.filter.write() = Some(filter);
    }

    /// Remove the delivery filter.
    pub fn clear_filter(&self) {
        *self.filter.write() = None;
    }

    /// Number of frames accepted for broadcast.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Close the bus. Delivery tasks drain what is buffered and stop.
    pub fn close(&self) {
        if self.sender.write().take().is_some() {
            info!("Invalidation bus closed");
        }
    }

    /// Publish an already encoded frame.
    ///
    /// Lets tests inject frames that do not decode.
    pub fn publish_frame(&self, frame: Bytes) -> Result<()> {
        let guard = self.sender.read();
        let sender = guard.as_ref().ok_or(BusError::Closed)?;

        self.published.fetch_add(1, Ordering::Relaxed);
        if sender.send(frame).is_err() {
            // No subscribers: nobody holds a copy to invalidate.
            debug!("Published invalidation with no subscribers");
        }
        Ok(())
    }

    async fn run_delivery(
        node_id: NodeId,
        mut receiver: broadcast::Receiver<Bytes>,
        handler: Arc<dyn InvalidationHandler>,
        filter: SharedFilter,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        debug!(node_id, "Starting invalidation delivery loop");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(node_id, "Invalidation delivery loop shutting down");
                    break;
                }
                frame = receiver.recv() => match frame {
                    Ok(frame) => {
                        let message = match InvalidationMessage::from_bytes(&frame) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(node_id, error = %e, "Dropping undecodable invalidation frame");
                                continue;
                            }
                        };

                        if message.origin == node_id {
                            continue;
                        }

                        let active = filter.read().clone();
                        if let Some(active) = active {
                            if !active.should_deliver(message.origin, node_id) {
                                debug!(node_id, origin = message.origin, id = %message.id, "Delivery filtered");
                                continue;
                            }
                        }

                        handler.on_invalidation(message).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(node_id, missed, "Invalidation subscriber lagged");
                        handler.on_lagged(missed).await;
                    }
                    Err(RecvError::Closed) => {
                        debug!(node_id, "Invalidation bus closed, stopping delivery");
                        break;
                    }
                },
            }
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl InvalidationBus for LocalBus {
    fn publish(&self, message: &InvalidationMessage) -> Result<()> {
        let frame = message.to_bytes()?;
        self.publish_frame(frame)?;
        debug!(
            origin = message.origin,
            id = %message.id,
            revision = message.revision(),
            tombstone = message.is_tombstone(),
            "Published invalidation"
        );
        Ok(())
    }

    fn subscribe(
        &self,
        node_id: NodeId,
        handler: Arc<dyn InvalidationHandler>,
    ) -> Result<Subscription> {
        let receiver = self
            .sender
            .read()
            .as_ref()
            .ok_or(BusError::Closed)?
            .subscribe();

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let filter = self.filter.clone();
        let task = tokio::spawn(Self::run_delivery(
            node_id,
            receiver,
            handler,
            filter,
            shutdown_rx,
        ));

        info!(node_id, "Subscribed to invalidation bus");
        Ok(Subscription::new(node_id, shutdown_tx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityId;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<InvalidationMessage>>,
        lagged: AtomicU64,
    }

    #[async_trait::async_trait]
    impl InvalidationHandler for Recorder {
        async fn on_invalidation(&self, message: InvalidationMessage) {
            self.messages.lock().push(message);
        }

        async fn on_lagged(&self, missed: u64) {
            self.lagged.fetch_add(missed, Ordering::Relaxed);
        }
    }

    #[derive(Debug)]
    struct DropAll;

    impl DeliveryFilter for DropAll {
        fn should_deliver(&self, _from: NodeId, _to: NodeId) -> bool {
            false
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_delivers_to_peers_not_origin() {
        let bus = LocalBus::new(16);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let _sa = bus.subscribe(1, a.clone()).unwrap();
        let _sb = bus.subscribe(2, b.clone()).unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(&InvalidationMessage::changed(1, EntityId::from("user#42"), 2))
            .unwrap();
        settle().await;

        assert!(a.messages.lock().is_empty());
        let received = b.messages.lock().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].revision(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_skipped() {
        let bus = LocalBus::new(16);
        let b = Arc::new(Recorder::default());
        let _sb = bus.subscribe(2, b.clone()).unwrap();

        bus.publish_frame(Bytes::from_static(b"\x01")).unwrap();
        bus.publish(&InvalidationMessage::changed(1, EntityId::from("user#1"), 1))
            .unwrap();
        settle().await;

        assert_eq!(b.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_filter_drops_delivery() {
        let bus = LocalBus::new(16);
        let b = Arc::new(Recorder::default());
        let _sb = bus.subscribe(2, b.clone()).unwrap();

        bus.set_filter(Arc::new(DropAll));
        bus.publish(&InvalidationMessage::changed(1, EntityId::from("user#1"), 1))
            .unwrap();
        settle().await;
        assert!(b.messages.lock().is_empty());

        bus.clear_filter();
        bus.publish(&InvalidationMessage::changed(1, EntityId::from("user#1"), 2))
            .unwrap();
        settle().await;
        assert_eq!(b.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told() {
        let bus = LocalBus::new(2);
        let b = Arc::new(Recorder::default());
        // Publish before the delivery task gets a chance to run.
        let _sb = bus.subscribe(2, b.clone()).unwrap();
        for revision in 1..=6 {
            bus.publish(&InvalidationMessage::changed(1, EntityId::from("user#1"), revision))
                .unwrap();
        }
        settle().await;

        assert!(b.lagged.load(Ordering::Relaxed) > 0);
        // The newest frames still arrive.
        assert_eq!(b.messages.lock().last().map(|m| m.revision()), Some(6));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let bus = LocalBus::new(16);
        let b = Arc::new(Recorder::default());
        let sub = bus.subscribe(2, b.clone()).unwrap();
        assert!(sub.is_active());

        sub.unsubscribe().await;
        bus.publish(&InvalidationMessage::changed(1, EntityId::from("user#1"), 1))
            .unwrap();
        settle().await;
        assert!(b.messages.lock().is_empty());

        bus.close();
        assert!(bus
            .publish(&InvalidationMessage::changed(1, EntityId::from("user#1"), 2))
            .is_err());
        assert!(bus.subscribe(3, b).is_err());
    }
}
