//! Shared inbound endpoint for asynchronous command replies
//!
//! One [`ResponseListener`] exists per subsystem. It is split into two
//! concurrently-running tasks communicating over a bounded channel:
//!
//! - a network **receiver** (axum server on the listener port) whose only
//!   job is to decode `POST /response` bodies and enqueue them;
//! - a single **dispatcher** that drains the queue and routes each reply
//!   to the matching [`ReplySlot`] through the name→slot registry.
//!
//! The receiver can be restarted independently without losing any
//! correlation state, which lives entirely on the dispatcher side. A reply
//! for an unregistered app name is logged and dropped, never a crash.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commander::ReplySlot;
use crate::wire::CommandReply;

/// Capacity of the raw-reply channel between receiver and dispatcher.
const RAW_QUEUE_CAPACITY: usize = 256;

/// How many times a receiver restart retries binding the port.
const REBIND_ATTEMPTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("could not bind response listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("a handler is already registered for app '{0}'")]
    AlreadyRegistered(String),

    #[error("no handler registered for app '{0}'")]
    NotRegistered(String),
}

/// Inbound reply endpoint plus dispatcher for one subsystem.
pub struct ResponseListener {
    port: u16,
    registry: Arc<RwLock<HashMap<String, ReplySlot>>>,
    raw_tx: mpsc::Sender<CommandReply>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseListener {
    /// Bind the listener and start both tasks. `port == 0` picks a free
    /// port; [`port()`](Self::port) reports the actual one.
    pub async fn bind(port: u16) -> Result<Self, ListenerError> {
        let (raw_tx, raw_rx) = mpsc::channel(RAW_QUEUE_CAPACITY);

        let socket = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(ListenerError::Bind)?;
        let port = socket.local_addr().map_err(ListenerError::Bind)?.port();

        let registry: Arc<RwLock<HashMap<String, ReplySlot>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let receiver = spawn_receiver(socket, raw_tx.clone());
        let dispatcher = spawn_dispatcher(raw_rx, Arc::clone(&registry));

        info!(port, "response listener started");

        Ok(Self {
            port,
            registry,
            raw_tx,
            receiver: Mutex::new(Some(receiver)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Port the receiver is bound to; the value to advertise in
    /// `X-Answer-Port`.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register the reply slot for an application name.
    pub fn register(&self, app: &str, slot: ReplySlot) -> Result<(), ListenerError> {
        let mut registry = self.registry.write();
        if registry.contains_key(app) {
            return Err(ListenerError::AlreadyRegistered(app.to_string()));
        }
        registry.insert(app.to_string(), slot);
        debug!(%app, "registered reply handler");
        Ok(())
    }

    /// Remove the reply slot for an application name.
    pub fn unregister(&self, app: &str) -> Result<(), ListenerError> {
        let mut registry = self.registry.write();
        if registry.remove(app).is_none() {
            return Err(ListenerError::NotRegistered(app.to_string()));
        }
        debug!(%app, "unregistered reply handler");
        Ok(())
    }

    /// Tear down and re-create the network receiver on the same port.
    ///
    /// Dispatcher state (the registry and any queued replies) survives.
    pub async fn restart_receiver(&self) -> Result<(), ListenerError> {
        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }

        // The freed port may linger briefly; retry the bind.
        let mut last_err = None;
        for _ in 0..REBIND_ATTEMPTS {
            match TcpListener::bind(("0.0.0.0", self.port)).await {
                Ok(socket) => {
                    *self.receiver.lock() = Some(spawn_receiver(socket, self.raw_tx.clone()));
                    info!(port = self.port, "response receiver restarted");
                    return Ok(());
                }
                Err(err) => {
                    last_err = Some(err);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
        Err(ListenerError::Bind(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "rebind failed")
        })))
    }

    /// Stop both the receiver and the dispatcher.
    pub fn terminate(&self) {
        if let Some(handle) = self.receiver.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        info!(port = self.port, "response listener terminated");
    }
}

impl Drop for ResponseListener {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_receiver(socket: TcpListener, raw_tx: mpsc::Sender<CommandReply>) -> JoinHandle<()> {
    let app = Router::new()
        .route("/response", post(receive_reply))
        .with_state(raw_tx);

    tokio::spawn(async move {
        if let Err(err) = axum::serve(socket, app).await {
            warn!(%err, "response receiver exited");
        }
    })
}

/// Receiver handler: enqueue the raw reply, nothing else.
async fn receive_reply(
    State(raw_tx): State<mpsc::Sender<CommandReply>>,
    Json(reply): Json<CommandReply>,
) -> &'static str {
    if raw_tx.send(reply).await.is_err() {
        warn!("dispatcher is gone, dropping reply");
    }
    "Response received"
}

fn spawn_dispatcher(
    mut raw_rx: mpsc::Receiver<CommandReply>,
    registry: Arc<RwLock<HashMap<String, ReplySlot>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(reply) = raw_rx.recv().await {
            let app = reply.appname.clone();
            let slot = registry.read().get(&app).cloned();
            match slot {
                Some(slot) => {
                    debug!(%app, ok = reply.is_ok(), "dispatching reply");
                    if !slot.deliver(reply) {
                        warn!(%app, "reply slot closed, dropping reply");
                    }
                }
                None => {
                    warn!(%app, "reply for unregistered app dropped");
                }
            }
        }
    })
}
