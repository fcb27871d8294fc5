//! The storage core's dispatch loop.
//!
//! Frames from one connection are handled strictly in arrival order by a
//! per-session worker; different connections proceed concurrently. The
//! storage core's key locks serialize conflicting writes across sessions.

use std::collections::HashMap;
use std::sync::Arc;

use kvault_channel::{CoreLink, Inbound, ReplySender};
use kvault_core::{decode, encode, peek_request_id, KvError, Origin, Request, Response, SessionId};
use kvault_storage::StorageCore;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct SessionWorker {
    tx: mpsc::UnboundedSender<Inbound>,
    reply: ReplySender,
}

/// Serves one [`StorageCore`] over a [`CoreLink`].
pub struct CoreService {
    core: Arc<StorageCore>,
    link: CoreLink,
    workers: HashMap<SessionId, SessionWorker>,
}

impl CoreService {
    pub fn new(core: Arc<StorageCore>, link: CoreLink) -> Self {
        Self {
            core,
            link,
            workers: HashMap::new(),
        }
    }

    /// Run on the current runtime until the returned handle shuts it down
    /// (or is dropped).
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let core = self.core.clone();
        let task = tokio::spawn(self.run(shutdown_rx));
        ServerHandle {
            core,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Dispatch inbound frames until `shutdown` fires or the hub goes away.
    /// The link is dropped on return, which takes the core offline.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!(endpoint = %self.link.endpoint(), "Storage core serving");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                inbound = self.link.recv() => match inbound {
                    Some(inbound) => self.dispatch(inbound),
                    None => break,
                },
            }
        }

        info!(endpoint = %self.link.endpoint(), "Storage core stopped");
    }

    fn dispatch(&mut self, inbound: Inbound) {
        if !self.workers.contains_key(&inbound.session) {
            self.workers.retain(|_, worker| !worker.reply.is_closed());
        }

        let core = &self.core;
        let worker = self
            .workers
            .entry(inbound.session)
            .or_insert_with(|| spawn_worker(core.clone(), inbound.reply.clone()));

        // A worker that has exited is replaced, and the frame goes to its
        // successor.
        if let Err(mpsc::error::SendError(inbound)) = worker.tx.send(inbound) {
            warn!(session = %inbound.session, "Session worker gone; respawning");
            let replacement = spawn_worker(self.core.clone(), inbound.reply.clone());
            let session = inbound.session;
            if replacement.tx.send(inbound).is_err() {
                warn!(session = %session, "Replacement worker refused frame");
                return;
            }
            self.workers.insert(session, replacement);
        }
    }
}

fn spawn_worker(core: Arc<StorageCore>, reply: ReplySender) -> SessionWorker {
    let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
    tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            let Some(response) = handle_isolated(&core, &inbound).await else {
                continue;
            };
            let frame = match encode(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(request_id = response.request_id, error = %e, "Failed to encode response");
                    continue;
                }
            };
            if inbound.reply.send(frame).is_err() {
                debug!(session = %inbound.session, "Connection closed before response");
            }
        }
    });
    SessionWorker { tx, reply }
}

/// Run [`handle_frame`] on its own task so a panic fails only that request.
/// The caller still gets an answer under its correlation id when one can be
/// recovered from the frame.
async fn handle_isolated(core: &Arc<StorageCore>, inbound: &Inbound) -> Option<Response> {
    let task = {
        let core = core.clone();
        let origin = inbound.origin.clone();
        let frame = inbound.frame.clone();
        tokio::spawn(async move { handle_frame(&core, &origin, &frame).await })
    };

    match task.await {
        Ok(response) => response,
        Err(e) => {
            error!(session = %inbound.session, origin = %inbound.origin, error = %e, "Request handler failed");
            let request_id = peek_request_id(&inbound.frame)?;
            let err = KvError::backend("execute", "request handler aborted");
            Some(Response::err(request_id, &err))
        }
    }
}

/// Decode one request frame from `origin`, run it, and build the response.
///
/// Frames that do not decode are answered with an `InvalidRequest` error
/// when a request id can still be recovered, and dropped otherwise.
pub async fn handle_frame(core: &StorageCore, origin: &Origin, frame: &str) -> Option<Response> {
    let request: Request = match decode(frame) {
        Ok(request) => request,
        Err(e) => {
            return match peek_request_id(frame) {
                Some(request_id) => {
                    warn!(origin = %origin, request_id, error = %e, "Rejecting malformed request");
                    Some(Response::err(request_id, &KvError::from(e)))
                }
                None => {
                    warn!(origin = %origin, error = %e, "Dropping uncorrelated frame");
                    None
                }
            };
        }
    };

    let request_id = request.request_id;
    let action = request.command.action();

    let response = match core.execute(origin, request.command).await {
        Ok(value) => Response::ok(request_id, value),
        Err(e) => {
            debug!(origin = %origin, request_id, action, kind = %e.kind(), "Request failed");
            Response::err(request_id, &e)
        }
    };
    Some(response)
}

/// Handle to a spawned [`CoreService`].
pub struct ServerHandle {
    core: Arc<StorageCore>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn core(&self) -> &Arc<StorageCore> {
        &self.core
    }

    /// Stop dispatching and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Storage core task ended abnormally");
        }
    }
}
