//! The hub: one named endpoint joining many tenants to a single core.
//!
//! Frames travel as JSON strings. Tenant to core traffic is stamped with the
//! connector's origin by the hub itself; the core answers through the
//! [`ReplySender`] attached to each [`Inbound`], which reaches only the
//! connection the frame came from. Change events go out on a separate
//! broadcast medium that every connection subscribes to.

use std::sync::{Arc, Mutex, MutexGuard};

use kvault_core::{encode, ChangeEvent, Origin, SessionId, TransportError};
use kvault_storage::ChangePublisher;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info};

use crate::connector::LocalConnector;

/// A request frame as delivered to the core.
#[derive(Debug)]
pub struct Inbound {
    /// Sender identity, attached by the hub. Never taken from the frame.
    pub origin: Origin,
    /// The connection the frame arrived on.
    pub session: SessionId,
    pub frame: String,
    pub reply: ReplySender,
}

/// Return path to exactly one connection.
#[derive(Debug, Clone)]
pub struct ReplySender {
    tx: mpsc::UnboundedSender<String>,
}

impl ReplySender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    /// True once the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct HubShared {
    endpoint: String,
    core: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    online: watch::Sender<bool>,
    broadcast: broadcast::Sender<String>,
}

impl HubShared {
    fn core_slot(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Inbound>>> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process transport endpoint.
///
/// Cloning is cheap; clones address the same endpoint.
#[derive(Clone)]
pub struct LocalHub {
    shared: Arc<HubShared>,
}

impl LocalHub {
    /// Create an endpoint named `endpoint`. `capacity` bounds how far a
    /// broadcast subscriber may fall behind before it observes a lag.
    pub fn new(endpoint: impl Into<String>, capacity: usize) -> Self {
        let (online, _) = watch::channel(false);
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(HubShared {
                endpoint: endpoint.into(),
                core: Mutex::new(None),
                online,
                broadcast,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Attach the storage core. Only one core may be attached at a time.
    pub fn attach_core(&self) -> Result<CoreLink, TransportError> {
        let mut slot = self.shared.core_slot();
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::CoreAlreadyAttached {
                endpoint: self.shared.endpoint.clone(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        drop(slot);

        self.shared.online.send_replace(true);
        info!(endpoint = %self.shared.endpoint, "Storage core attached");

        Ok(CoreLink {
            inbound: rx,
            shared: self.shared.clone(),
        })
    }

    /// A connector that will present `origin` to the core.
    pub fn connector(&self, origin: Origin) -> LocalConnector {
        LocalConnector::new(self.clone(), origin)
    }

    pub fn is_core_online(&self) -> bool {
        *self.shared.online.borrow()
    }

    /// Observe the broadcast medium without holding a connection.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.shared.broadcast.subscribe()
    }

    /// Publisher that writes change events onto this hub's broadcast medium.
    pub fn publisher(&self) -> HubPublisher {
        HubPublisher {
            tx: self.shared.broadcast.clone(),
        }
    }

    pub(crate) fn core_sender(&self) -> Option<mpsc::UnboundedSender<Inbound>> {
        self.shared.core_slot().clone()
    }

    pub(crate) fn watch_online(&self) -> watch::Receiver<bool> {
        self.shared.online.subscribe()
    }
}

/// The core's end of the hub. Dropping it takes the core offline.
pub struct CoreLink {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<HubShared>,
}

impl CoreLink {
    /// Next inbound frame, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn publisher(&self) -> HubPublisher {
        HubPublisher {
            tx: self.shared.broadcast.clone(),
        }
    }
}

impl Drop for CoreLink {
    fn drop(&mut self) {
        *self.shared.core_slot() = None;
        self.shared.online.send_replace(false);
        info!(endpoint = %self.shared.endpoint, "Storage core detached");
    }
}

/// [`ChangePublisher`] that encodes events as JSON broadcast frames.
#[derive(Clone)]
pub struct HubPublisher {
    tx: broadcast::Sender<String>,
}

impl ChangePublisher for HubPublisher {
    fn publish(&self, event: ChangeEvent) {
        let frame = match encode(&event) {
            Ok(frame) => frame,
            Err(e) => {
                error!(key = %event.key, error = %e, "Failed to encode change event");
                return;
            }
        };

        match self.tx.send(frame) {
            Ok(receivers) => {
                debug!(key = %event.key, action = ?event.action, receivers, "Broadcast change event");
            }
            Err(_) => {
                debug!(key = %event.key, "No receivers for change event");
            }
        }
    }
}
