//! Tenant side of the transport.

use std::time::Duration;

use async_trait::async_trait;
use kvault_core::{new_session_id, Origin, SessionId, TransportError};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use crate::hub::{Inbound, LocalHub, ReplySender};

/// Establishes connections to a storage core endpoint on behalf of one
/// tenant. The origin is fixed by whoever built the connector.
#[async_trait]
pub trait Connector: Send + Sync {
    fn origin(&self) -> &Origin;

    /// Open a connection, waiting at most `timeout` for a core to be present.
    async fn connect(&self, endpoint: &str, timeout: Duration) -> Result<Connection, TransportError>;
}

/// An open connection, split into its sending half and its event streams.
pub struct Connection {
    pub sender: FrameSender,
    pub events: ConnectionEvents,
}

/// Sends request frames to the core. Clones share the connection.
#[derive(Debug, Clone)]
pub struct FrameSender {
    origin: Origin,
    session: SessionId,
    core: mpsc::UnboundedSender<Inbound>,
    reply: ReplySender,
}

impl FrameSender {
    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.core
            .send(Inbound {
                origin: self.origin.clone(),
                session: self.session,
                frame,
                reply: self.reply.clone(),
            })
            .map_err(|_| TransportError::Closed)
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn session(&self) -> SessionId {
        self.session
    }
}

/// Everything a connection receives.
pub struct ConnectionEvents {
    /// Response frames addressed to this connection.
    pub replies: mpsc::UnboundedReceiver<String>,
    /// Change event frames from the broadcast medium.
    pub broadcasts: broadcast::Receiver<String>,
    /// Flips to `false` when the core detaches.
    pub online: watch::Receiver<bool>,
}

/// [`Connector`] for a [`LocalHub`].
#[derive(Clone)]
pub struct LocalConnector {
    hub: LocalHub,
    origin: Origin,
}

impl LocalConnector {
    pub fn new(hub: LocalHub, origin: Origin) -> Self {
        Self { hub, origin }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn origin(&self) -> &Origin {
        &self.origin
    }

    async fn connect(&self, endpoint: &str, timeout: Duration) -> Result<Connection, TransportError> {
        let setup_failed = |reason: String| TransportError::SetupFailed {
            endpoint: endpoint.to_string(),
            reason,
        };

        if endpoint != self.hub.endpoint() {
            warn!(endpoint, origin = %self.origin, "Unknown transport endpoint");
            return Err(setup_failed(format!(
                "no such endpoint (hub serves '{}')",
                self.hub.endpoint()
            )));
        }

        // Subscribe before the core can publish anything we would miss.
        let broadcasts = self.hub.subscribe();
        let mut online = self.hub.watch_online();

        let attached = match tokio::time::timeout(timeout, online.wait_for(|up| *up)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) | Err(_) => false,
        };
        if !attached {
            return Err(setup_failed(format!(
                "no storage core attached within {}ms",
                timeout.as_millis()
            )));
        }

        let core = self
            .hub
            .core_sender()
            .ok_or_else(|| setup_failed("storage core detached during connect".to_string()))?;

        let (reply_tx, replies) = mpsc::unbounded_channel();
        let session = new_session_id();
        debug!(endpoint, origin = %self.origin, session = %session, "Connection established");

        Ok(Connection {
            sender: FrameSender {
                origin: self.origin.clone(),
                session,
                core,
                reply: ReplySender::new(reply_tx),
            },
            events: ConnectionEvents {
                replies,
                broadcasts,
                online,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvault_core::{ChangeEvent, TransportError};
    use kvault_storage::ChangePublisher;

    fn origin(raw: &str) -> Origin {
        Origin::parse(raw).expect("origin should parse")
    }

    #[tokio::test]
    async fn test_frames_are_stamped_with_connector_origin() {
        let hub = LocalHub::new("core", 8);
        let mut link = hub.attach_core().expect("attach should succeed");
        let conn = hub
            .connector(origin("https://a"))
            .connect("core", Duration::from_millis(100))
            .await
            .expect("connect should succeed");

        conn.sender
            .send(r#"{"action":"keys","requestId":1,"origin":"https://evil"}"#.to_string())
            .expect("send should succeed");

        let inbound = link.recv().await.expect("frame should arrive");
        assert_eq!(inbound.origin, origin("https://a"));
        assert_eq!(inbound.session, conn.sender.session());
    }

    #[tokio::test]
    async fn test_reply_reaches_only_sender() {
        let hub = LocalHub::new("core", 8);
        let mut link = hub.attach_core().expect("attach should succeed");
        let timeout = Duration::from_millis(100);
        let mut a = hub.connector(origin("https://a")).connect("core", timeout).await.expect("connect a");
        let mut b = hub.connector(origin("https://b")).connect("core", timeout).await.expect("connect b");

        a.sender.send("ping".to_string()).expect("send should succeed");
        let inbound = link.recv().await.expect("frame should arrive");
        inbound.reply.send("pong".to_string()).expect("reply should succeed");

        assert_eq!(a.events.replies.recv().await.as_deref(), Some("pong"));
        assert!(b.events.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_waits_for_core() {
        let hub = LocalHub::new("core", 8);
        let connector = hub.connector(origin("https://a"));

        let pending = tokio::spawn(async move {
            connector.connect("core", Duration::from_secs(2)).await.map(|_| ())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _link = hub.attach_core().expect("attach should succeed");

        pending
            .await
            .expect("task should finish")
            .expect("connect should succeed once core attaches");
    }

    #[tokio::test]
    async fn test_connect_times_out_without_core() {
        let hub = LocalHub::new("core", 8);
        let err = hub
            .connector(origin("https://a"))
            .connect("core", Duration::from_millis(20))
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, TransportError::SetupFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_unknown_endpoint() {
        let hub = LocalHub::new("core", 8);
        let _link = hub.attach_core().expect("attach should succeed");
        let err = hub
            .connector(origin("https://a"))
            .connect("elsewhere", Duration::from_millis(20))
            .await
            .err()
            .expect("connect should fail");
        assert!(err.to_string().contains("elsewhere"));
    }

    #[tokio::test]
    async fn test_connection_sees_broadcasts_and_detach() {
        let hub = LocalHub::new("core", 8);
        let link = hub.attach_core().expect("attach should succeed");
        let mut conn = hub
            .connector(origin("https://a"))
            .connect("core", Duration::from_millis(100))
            .await
            .expect("connect should succeed");

        link.publisher().publish(ChangeEvent::set("k"));
        assert!(conn.events.broadcasts.recv().await.is_ok());

        drop(link);
        conn.events.online.changed().await.expect("watch should notify");
        assert!(!*conn.events.online.borrow());
        assert_eq!(conn.sender.send("late".to_string()), Err(TransportError::Closed));
    }
}
