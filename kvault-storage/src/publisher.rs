//! Change broadcast publishing.
//!
//! The storage core announces every mutation of the durable store, including
//! lazy-expiry deletions, through a [`ChangePublisher`]. Events carry no
//! value; observers re-fetch if they need the new data.

use kvault_core::ChangeEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Sink for change events. Publishing never fails the originating
/// operation: the mutation is already durable when the event is emitted.
pub trait ChangePublisher: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

/// Publisher backed by a tokio broadcast channel.
///
/// Slow subscribers that fall more than `capacity` events behind observe
/// `RecvError::Lagged` and must treat their caches as fully stale.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl ChangePublisher for BroadcastPublisher {
    fn publish(&self, event: ChangeEvent) {
        let key = event.key.clone();
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(key = %key, receivers, "Broadcast change event");
            }
            Err(_) => {
                // No receivers connected - this is fine
                debug!(key = %key, "No receivers for change event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_event() {
        let publisher = BroadcastPublisher::new(16);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        publisher.publish(ChangeEvent::set("k"));

        assert_eq!(first.recv().await.expect("recv should succeed"), ChangeEvent::set("k"));
        assert_eq!(second.recv().await.expect("recv should succeed"), ChangeEvent::set("k"));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::new(4);
        publisher.publish(ChangeEvent::remove("k"));
    }
}
