//! The per-tenant client proxy.
//!
//! # Connection lifecycle
//!
//! ```text
//! Uninitialized --first use--> Initializing --connected--> Ready
//!                                   |                        |
//!                                   +--setup error--> Failed <--core offline
//! ```
//!
//! Requests issued while `Initializing` are queued and sent in submission
//! order once the connection opens. Entering `Failed` rejects everything
//! queued or in flight with `CoreUnavailable`. `Failed` is terminal; build a
//! new proxy to retry.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use kvault_channel::{Connection, ConnectionEvents, Connector, FrameSender, LocalHub};
use kvault_core::{
    decode, encode, ChangeEvent, ClientError, Command, ConfigError, KvError, KvResult, Request,
    RequestId, Response, SetOptions, TransportError,
};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, ReadCache, ReadTicket};
use crate::config::ClientConfig;
use crate::pending::PendingRequests;

/// Capacity of the channel behind [`ClientProxy::changes`].
const CHANGE_FEED_CAPACITY: usize = 256;

/// Reachability of the storage core as seen by one proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

impl ConnectionState {
    fn is_settled(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Initializing => "initializing",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

enum Link {
    Uninitialized,
    Initializing { queue: VecDeque<(RequestId, String)> },
    Ready { sender: FrameSender },
    Failed { cause: Option<TransportError> },
}

enum Dispatch {
    Sent,
    Queued(usize),
    SendFailed(TransportError),
    Rejected(Option<TransportError>),
}

struct ProxyInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    link: Mutex<Link>,
    state: watch::Sender<ConnectionState>,
    pending: PendingRequests,
    cache: Mutex<ReadCache>,
    next_id: AtomicU64,
    changes: broadcast::Sender<ChangeEvent>,
}

/// Async façade over the storage core for one tenant.
///
/// Cloning is cheap; clones share the connection, queue, and cache.
#[derive(Clone)]
pub struct ClientProxy {
    inner: Arc<ProxyInner>,
}

impl ClientProxy {
    /// Validate `config` and build an idle proxy. Nothing connects until the
    /// first operation or [`ClientProxy::ensure_ready`].
    pub fn new<C>(connector: C, config: ClientConfig) -> KvResult<Self>
    where
        C: Connector + 'static,
    {
        config.validate()?;
        if connector.origin() != &config.origin {
            return Err(ConfigError::InvalidValue {
                field: "origin".to_string(),
                value: config.origin.to_string(),
                reason: format!("connector presents '{}'", connector.origin()),
            }
            .into());
        }

        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);

        Ok(Self {
            inner: Arc::new(ProxyInner {
                config,
                connector: Arc::new(connector),
                link: Mutex::new(Link::Uninitialized),
                state,
                pending: PendingRequests::new(),
                cache: Mutex::new(ReadCache::new()),
                next_id: AtomicU64::new(1),
                changes,
            }),
        })
    }

    /// Proxy connecting through `hub` as `config.origin`.
    pub fn for_hub(hub: &LocalHub, config: ClientConfig) -> KvResult<Self> {
        let connector = hub.connector(config.origin.clone());
        Self::new(connector, config)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Start connecting if nobody has yet, and wait until the core is
    /// reachable or the attempt has failed.
    pub async fn ensure_ready(&self) -> KvResult<()> {
        let mut state = self.inner.state.subscribe();
        self.inner.start();

        let settled = *state
            .wait_for(|s| s.is_settled())
            .await
            .map_err(|_| ClientError::CoreUnavailable { cause: None })?;

        match settled {
            ConnectionState::Ready => Ok(()),
            _ => Err(ClientError::CoreUnavailable {
                cause: self.inner.failure_cause(),
            }
            .into()),
        }
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Store `value` under `key` with the configured default options.
    pub async fn set_item(&self, key: &str, value: Value) -> KvResult<()> {
        self.set_item_with_options(key, value, SetOptions::default()).await
    }

    /// Store `value` under `key`. Fields set in `options` win over the
    /// configured defaults.
    pub async fn set_item_with_options(
        &self,
        key: &str,
        value: Value,
        options: SetOptions,
    ) -> KvResult<()> {
        self.inner.cache().invalidate(key);
        let options = options.merged_over(&self.inner.config.default_options);
        self.inner
            .request(Command::Set {
                key: key.to_string(),
                value,
                options,
            })
            .await
            .map(|_| ())
    }

    /// Read `key`, from the cache when possible. Absent keys read as `None`
    /// and are cached as such.
    pub async fn get_item(&self, key: &str) -> KvResult<Option<Value>> {
        if let Some(hit) = self.inner.cache().lookup(key) {
            return Ok(hit);
        }

        let mut read = PendingRead {
            cache: &self.inner.cache,
            ticket: Some(self.inner.cache().begin_read(key)),
        };

        let value = self
            .inner
            .request(Command::Get {
                key: key.to_string(),
            })
            .await?;

        read.finish(value.clone());
        Ok(value)
    }

    pub async fn remove_item(&self, key: &str) -> KvResult<()> {
        self.inner.cache().invalidate(key);
        self.inner
            .request(Command::Remove {
                key: key.to_string(),
            })
            .await
            .map(|_| ())
    }

    /// Remove every item this tenant may write. The whole local cache is
    /// dropped first, since the proxy cannot tell which keys that covers.
    pub async fn clear(&self) -> KvResult<()> {
        self.inner.cache().clear();
        self.inner.request(Command::Clear).await.map(|_| ())
    }

    /// Keys this tenant may read. Never served from the cache.
    pub async fn keys(&self) -> KvResult<Vec<String>> {
        let value = self.inner.request(Command::Keys).await?;
        let malformed = || TransportError::Malformed {
            reason: "keys response is not an array of strings".to_string(),
        };

        match value {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(key) => Ok(key),
                    _ => Err(malformed().into()),
                })
                .collect(),
            Some(_) => Err(malformed().into()),
        }
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    /// Change events as received from the broadcast medium. The proxy
    /// invalidates its own cache regardless of whether anyone listens.
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache().stats()
    }

    /// Requests registered and not yet settled, queued ones included.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

/// A cache read in flight. Dropping it without `finish` releases the ticket.
struct PendingRead<'a> {
    cache: &'a Mutex<ReadCache>,
    ticket: Option<ReadTicket>,
}

impl PendingRead<'_> {
    fn finish(&mut self, value: Option<Value>) {
        if let Some(ticket) = self.ticket.take() {
            let stored = lock(self.cache).finish_read(ticket, value);
            if !stored {
                debug!("Skipped caching a read invalidated in flight");
            }
        }
    }
}

impl Drop for PendingRead<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            lock(self.cache).abandon(ticket);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProxyInner {
    fn link(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }

    fn cache(&self) -> MutexGuard<'_, ReadCache> {
        lock(&self.cache)
    }

    fn failure_cause(&self) -> Option<TransportError> {
        match &*self.link() {
            Link::Failed { cause } => cause.clone(),
            _ => None,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(
                origin = %self.config.origin,
                endpoint = %self.config.endpoint,
                from = %previous,
                to = %state,
                "Connection state changed"
            );
        }
    }

    /// Leave `Uninitialized` and spawn the connect attempt.
    fn start(self: &Arc<Self>) {
        let mut link = self.link();
        self.start_locked(&mut link);
    }

    fn start_locked(self: &Arc<Self>, link: &mut Link) {
        if !matches!(link, Link::Uninitialized) {
            return;
        }
        *link = Link::Initializing {
            queue: VecDeque::new(),
        };
        self.set_state(ConnectionState::Initializing);
        tokio::spawn(establish(self.clone()));
    }

    async fn request(self: &Arc<Self>, command: Command) -> KvResult<Option<Value>> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let action = command.action();
        let frame = encode(&Request::new(request_id, command))?;
        let rx = self.pending.register(request_id);

        match self.dispatch(request_id, frame) {
            Dispatch::Sent => debug!(request_id, action, "Request sent"),
            Dispatch::Queued(depth) => debug!(request_id, action, depth, "Request queued"),
            Dispatch::SendFailed(e) => self.fail(e),
            Dispatch::Rejected(cause) => {
                self.pending.forget(request_id);
                return Err(ClientError::CoreUnavailable { cause }.into());
            }
        }

        self.await_response(request_id, rx).await
    }

    /// Send or queue `frame` according to the current link state.
    fn dispatch(self: &Arc<Self>, request_id: RequestId, frame: String) -> Dispatch {
        let mut link = self.link();
        self.start_locked(&mut link);

        let outcome = match &mut *link {
            Link::Ready { sender } => match sender.send(frame) {
                Ok(()) => Dispatch::Sent,
                Err(e) => Dispatch::SendFailed(e),
            },
            Link::Initializing { queue } => {
                queue.push_back((request_id, frame));
                Dispatch::Queued(queue.len())
            }
            Link::Failed { cause } => Dispatch::Rejected(cause.clone()),
            Link::Uninitialized => Dispatch::Rejected(None),
        };
        outcome
    }

    async fn await_response(
        &self,
        request_id: RequestId,
        rx: oneshot::Receiver<KvResult<Option<Value>>>,
    ) -> KvResult<Option<Value>> {
        let settled = match self.config.request_timeout_ms {
            Some(ms) => {
                let after = Duration::from_millis(ms);
                match tokio::time::timeout(after, rx).await {
                    Ok(settled) => settled,
                    Err(_) => {
                        let withdrawn = self.withdraw_queued(request_id);
                        self.pending.forget(request_id);
                        warn!(request_id, ?after, withdrawn, "Request timed out");
                        return Err(ClientError::Timeout { request_id, after }.into());
                    }
                }
            }
            None => rx.await,
        };

        settled.unwrap_or_else(|_| Err(ClientError::CoreUnavailable { cause: None }.into()))
    }

    /// Drop a request that has not been sent yet, so it never reaches the
    /// core. Returns whether it was still queued.
    fn withdraw_queued(&self, request_id: RequestId) -> bool {
        let mut link = self.link();
        let Link::Initializing { queue } = &mut *link else {
            return false;
        };
        let before = queue.len();
        queue.retain(|(id, _)| *id != request_id);
        queue.len() != before
    }

    fn on_connected(self: &Arc<Self>, connection: Connection) {
        let Connection { sender, events } = connection;
        let mut link = self.link();

        let queue = match std::mem::replace(&mut *link, Link::Ready { sender: sender.clone() }) {
            Link::Initializing { queue } => queue,
            other => {
                // Lost a race with failure; stay where we are.
                *link = other;
                return;
            }
        };

        let drained = queue.len();
        for (request_id, frame) in queue {
            if let Err(e) = sender.send(frame) {
                warn!(request_id, "Core went away while draining queue");
                drop(link);
                self.fail(e);
                return;
            }
        }
        drop(link);

        debug!(drained, "Flushed queued requests");
        self.set_state(ConnectionState::Ready);
        tokio::spawn(listen(Arc::downgrade(self), events));
    }

    /// Enter `Failed` and reject everything outstanding.
    fn fail(&self, cause: TransportError) {
        {
            let mut link = self.link();
            if matches!(*link, Link::Failed { .. }) {
                return;
            }
            *link = Link::Failed {
                cause: Some(cause.clone()),
            };
        }
        self.set_state(ConnectionState::Failed);

        let err = KvError::from(ClientError::CoreUnavailable { cause: Some(cause) });
        let rejected = self.pending.reject_all(&err);
        warn!(origin = %self.config.origin, rejected, error = %err, "Storage core unavailable");
    }

    fn on_reply(&self, frame: &str) {
        let response: Response = match decode(frame) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable response");
                return;
            }
        };

        let request_id = response.request_id;
        let result = response.into_result().map_err(|e| {
            KvError::from(ClientError::Rejected {
                kind: e.kind,
                message: e.message,
            })
        });

        if !self.pending.complete(request_id, result) {
            debug!(request_id, "Dropping response for unknown request");
        }
    }

    fn on_broadcast(&self, frame: &str) {
        let event: ChangeEvent = match decode(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable change event");
                return;
            }
        };

        self.cache().invalidate(&event.key);
        let _ = self.changes.send(event);
    }

    fn on_lag(&self, skipped: u64) {
        warn!(skipped, "Missed change events; dropping read cache");
        self.cache().clear();
    }
}

async fn establish(inner: Arc<ProxyInner>) {
    let timeout = Duration::from_millis(inner.config.connect_timeout_ms);
    match inner.connector.connect(&inner.config.endpoint, timeout).await {
        Ok(connection) => inner.on_connected(connection),
        Err(e) => inner.fail(e),
    }
}

/// Route replies and change events until the core goes away or the proxy
/// is dropped.
async fn listen(inner: Weak<ProxyInner>, events: ConnectionEvents) {
    let ConnectionEvents {
        mut replies,
        mut broadcasts,
        mut online,
    } = events;

    loop {
        // Invalidations published before a reply must land before it does.
        tokio::select! {
            biased;

            event = broadcasts.recv() => {
                let Some(inner) = inner.upgrade() else { return };
                match event {
                    Ok(frame) => inner.on_broadcast(&frame),
                    Err(RecvError::Lagged(skipped)) => inner.on_lag(skipped),
                    Err(RecvError::Closed) => {
                        inner.fail(TransportError::Closed);
                        return;
                    }
                }
            }
            reply = replies.recv() => {
                let Some(inner) = inner.upgrade() else { return };
                match reply {
                    Some(frame) => inner.on_reply(&frame),
                    None => {
                        inner.fail(TransportError::Closed);
                        return;
                    }
                }
            }
            changed = online.changed() => {
                let up = *online.borrow();
                if changed.is_err() || !up {
                    if let Some(inner) = inner.upgrade() {
                        inner.fail(TransportError::Closed);
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvault_core::{ErrorKind, Origin};

    fn origin(raw: &str) -> Origin {
        Origin::parse(raw).expect("origin should parse")
    }

    fn config(endpoint: &str) -> ClientConfig {
        ClientConfig::new(origin("https://a"), endpoint).with_connect_timeout_ms(50)
    }

    #[test]
    fn test_new_is_idle() {
        let hub = LocalHub::new("core", 8);
        let proxy = ClientProxy::for_hub(&hub, config("core")).expect("proxy should build");
        assert_eq!(proxy.state(), ConnectionState::Uninitialized);
        assert_eq!(proxy.pending_requests(), 0);
    }

    #[test]
    fn test_origin_mismatch_rejected() {
        let hub = LocalHub::new("core", 8);
        let connector = hub.connector(origin("https://b"));
        let err = ClientProxy::new(connector, config("core"))
            .err()
            .expect("mismatched origin should fail");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_setup_failure_rejects_queued_requests() {
        let hub = LocalHub::new("core", 8);
        let proxy = ClientProxy::for_hub(&hub, config("core")).expect("proxy should build");

        let (first, second) = tokio::join!(proxy.keys(), proxy.get_item("k"));

        for err in [first.expect_err("should fail"), second.expect_err("should fail")] {
            assert_eq!(err.kind(), ErrorKind::CoreUnavailable);
            assert!(err.to_string().contains("no storage core attached"));
        }
        assert_eq!(proxy.state(), ConnectionState::Failed);
        assert_eq!(proxy.pending_requests(), 0);
        assert_eq!(proxy.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn test_failed_is_terminal() {
        let hub = LocalHub::new("core", 8);
        let proxy = ClientProxy::for_hub(&hub, config("nowhere")).expect("proxy should build");

        let err = proxy.ensure_ready().await.expect_err("unknown endpoint");
        assert_eq!(err.kind(), ErrorKind::CoreUnavailable);

        let _link = hub.attach_core().expect("attach should succeed");
        let err = proxy.remove_item("k").await.expect_err("still failed");
        assert_eq!(err.kind(), ErrorKind::CoreUnavailable);
        assert_eq!(proxy.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Initializing.to_string(), "initializing");
        assert!(ConnectionState::Failed.is_settled());
        assert!(!ConnectionState::Uninitialized.is_settled());
    }
}
