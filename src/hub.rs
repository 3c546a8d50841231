//! The hub: a serializing coordinator for a population of connections.
//!
//! One event-loop task consumes a single command channel, so every
//! membership-affecting operation (register, unregister, dispatch,
//! broadcast, join/leave) observes a total order and registration can
//! never race a broadcast.  Non-membership operations (per-connection
//! send, metrics reads, room-local broadcast) go around the loop.
//!
//! Commands from one task are processed in send order, which also gives
//! the ordering guarantee that a connection's registration is handled
//! before any message it produces.

use crate::config::HubConfig;
use crate::connection::Connection;
use crate::error::HubError;
use crate::handler::{Handler, HandlerRegistry, MessageContext};
use crate::metrics::HubMetrics;
use crate::room::RoomManager;
use crate::send_queue::EnqueueError;
use crate::state_store::StateStore;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use relay_protocol::{Envelope, MessageKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Commands and callbacks
// ---------------------------------------------------------------------------

pub(crate) enum HubCommand {
    Register(Arc<Connection>),
    Unregister(Arc<Connection>),
    Message(MessageContext),
    BroadcastAll {
        frame: Vec<u8>,
        exclude: Option<String>,
    },
    BroadcastRoom {
        room: String,
        frame: Vec<u8>,
        exclude: Option<String>,
    },
    Join {
        connection: Arc<Connection>,
        room: String,
    },
    Leave {
        connection: Arc<Connection>,
        room: String,
    },
    Shutdown,
}

/// Lifecycle callback invoked on connect/disconnect.
pub type ConnectionCallback =
    Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, Result<(), HubError>> + Send + Sync>;

/// Wrap an async closure into a registrable [`ConnectionCallback`].
pub fn connection_callback<F, Fut>(f: F) -> ConnectionCallback
where
    F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HubError>> + Send + 'static,
{
    Arc::new(move |conn| f(conn).boxed())
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

pub struct Hub {
    config: Arc<HubConfig>,
    metrics: Arc<HubMetrics>,
    rooms: RoomManager,
    handlers: HandlerRegistry,
    state: StateStore,
    connections: tokio::sync::RwLock<HashMap<String, Arc<Connection>>>,
    tx: mpsc::UnboundedSender<HubCommand>,
    /// Taken by the first `run()`; `None` afterwards (double-run guard).
    rx: Mutex<Option<mpsc::UnboundedReceiver<HubCommand>>>,
    loop_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    connect_callbacks: RwLock<Vec<ConnectionCallback>>,
    disconnect_callbacks: RwLock<Vec<ConnectionCallback>>,
    connect_route_callbacks: RwLock<HashMap<String, Vec<ConnectionCallback>>>,
    disconnect_route_callbacks: RwLock<HashMap<String, Vec<ConnectionCallback>>>,
}

impl Hub {
    /// Build a hub from `config` (normalized first, see
    /// [`HubConfig::normalized`]).  Call [`Hub::run`] to start the
    /// event loop.
    pub fn new(config: HubConfig) -> Arc<Self> {
        let config = Arc::new(config.normalized());
        let metrics = Arc::new(HubMetrics::new(config.enable_metrics));
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Hub {
            rooms: RoomManager::new(config.max_connections_per_room, metrics.clone()),
            handlers: HandlerRegistry::new(),
            state: StateStore::new(config.reconnection_timeout, config.max_reconnection_time),
            connections: tokio::sync::RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            loop_handle: tokio::sync::Mutex::new(None),
            connect_callbacks: RwLock::new(Vec::new()),
            disconnect_callbacks: RwLock::new(Vec::new()),
            connect_route_callbacks: RwLock::new(HashMap::new()),
            disconnect_route_callbacks: RwLock::new(HashMap::new()),
            metrics,
            config,
        })
    }

    /// Start the event loop.  A second call while one loop instance is
    /// running returns immediately.
    pub async fn run(self: &Arc<Self>) {
        let Some(rx) = self.rx.lock().expect("hub receiver poisoned").take() else {
            debug!("hub event loop already running");
            return;
        };
        let hub = self.clone();
        let handle = tokio::spawn(event_loop(hub, rx));
        *self.loop_handle.lock().await = Some(handle);
    }

    /// Close every connection, wait for them to self-unregister, then
    /// stop the event loop.  Safe to call repeatedly, and without a
    /// prior `run()`.
    pub async fn shutdown(&self) {
        let conns: Vec<Arc<Connection>> = self.connections.read().await.values().cloned().collect();
        info!(connections = conns.len(), "hub shutting down");
        for conn in conns {
            conn.close();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.connections.read().await.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown timed out waiting for connections to drain");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.tx.send(HubCommand::Shutdown);
            let _ = handle.await;
        }
    }

    // -----------------------------------------------------------------------
    // Loop-serialized operations (enqueue a command; the event loop
    // executes them in send order)
    // -----------------------------------------------------------------------

    pub(crate) fn register(&self, conn: Arc<Connection>) {
        let _ = self.tx.send(HubCommand::Register(conn));
    }

    pub(crate) fn unregister(&self, conn: Arc<Connection>) {
        let _ = self.tx.send(HubCommand::Unregister(conn));
    }

    /// Feed a parsed inbound envelope into the dispatch pipeline.
    pub(crate) fn ingest(&self, connection: Arc<Connection>, envelope: Envelope) {
        let _ = self.tx.send(HubCommand::Message(MessageContext {
            connection,
            envelope,
        }));
    }

    /// Broadcast `frame` to every registered connection except
    /// `exclude`.  A full send queue evicts that connection: the loop
    /// must not stall, so an unresponsive peer is treated as dead here
    /// (unlike per-connection `send`).
    pub fn broadcast_all(&self, frame: Vec<u8>, exclude: Option<String>) {
        let _ = self.tx.send(HubCommand::BroadcastAll { frame, exclude });
    }

    /// Broadcast `frame` to the members of `room`, except `exclude`.
    pub fn broadcast_room(&self, room: &str, frame: Vec<u8>, exclude: Option<String>) {
        let _ = self.tx.send(HubCommand::BroadcastRoom {
            room: room.to_owned(),
            frame,
            exclude,
        });
    }

    /// Loop-ordered mirror of [`Connection::join`].
    pub fn join(&self, connection: Arc<Connection>, room: &str) {
        let _ = self.tx.send(HubCommand::Join {
            connection,
            room: room.to_owned(),
        });
    }

    /// Loop-ordered mirror of [`Connection::leave`].
    pub fn leave(&self, connection: Arc<Connection>, room: &str) {
        let _ = self.tx.send(HubCommand::Leave {
            connection,
            room: room.to_owned(),
        });
    }

    // -----------------------------------------------------------------------
    // Direct (non-loop) surfaces
    // -----------------------------------------------------------------------

    /// Send to one connection under its configured backpressure
    /// strategy.
    pub async fn send_to(&self, connection_id: &str, frame: Vec<u8>) -> Result<(), HubError> {
        let conn = self
            .connections
            .read()
            .await
            .get(connection_id)
            .cloned()
            .ok_or_else(|| HubError::ConnectionNotFound(connection_id.to_owned()))?;
        conn.send(frame).await
    }

    pub async fn connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn metrics(&self) -> &HubMetrics {
        &self.metrics
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub(crate) fn config_arc(&self) -> Arc<HubConfig> {
        self.config.clone()
    }

    pub(crate) fn metrics_arc(&self) -> Arc<HubMetrics> {
        self.metrics.clone()
    }

    // -----------------------------------------------------------------------
    // Handler and callback registration
    // -----------------------------------------------------------------------

    pub fn on(&self, kind: MessageKind, h: Handler) {
        self.handlers.on(kind, h);
    }

    pub fn on_event(&self, event: impl Into<String>, h: Handler) {
        self.handlers.on_event(event, h);
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn on_connect(&self, cb: ConnectionCallback) {
        self.connect_callbacks
            .write()
            .expect("callback table poisoned")
            .push(cb);
    }

    pub fn on_disconnect(&self, cb: ConnectionCallback) {
        self.disconnect_callbacks
            .write()
            .expect("callback table poisoned")
            .push(cb);
    }

    /// Connect callback scoped to connections that matched `pattern`
    /// at upgrade time.
    pub fn on_connect_route(&self, pattern: &str, cb: ConnectionCallback) {
        self.connect_route_callbacks
            .write()
            .expect("callback table poisoned")
            .entry(pattern.to_owned())
            .or_default()
            .push(cb);
    }

    pub fn on_disconnect_route(&self, pattern: &str, cb: ConnectionCallback) {
        self.disconnect_route_callbacks
            .write()
            .expect("callback table poisoned")
            .entry(pattern.to_owned())
            .or_default()
            .push(cb);
    }

    // -----------------------------------------------------------------------
    // Reconnection
    // -----------------------------------------------------------------------

    /// Restore preserved state onto a new connection.
    ///
    /// Returns false when no usable record exists.  The record is
    /// consumed either way it is found: restoration is exactly-once
    /// and a stale record is deleted rather than left to mask a later
    /// restore.
    pub async fn restore_connection(&self, conn: &Arc<Connection>, client_id: &str) -> bool {
        let Some(state) = self.state.take(client_id) else {
            return false;
        };
        let mut attrs = state.attributes;
        attrs.insert("clientID".to_owned(), json!(client_id));
        conn.set_attrs(attrs);
        for room in &state.rooms {
            if let Err(e) = self.rooms.add_to_room(room, conn.clone()).await {
                warn!(connection_id = %conn.id(), room = %room, error = %e, "could not rejoin room on restore");
            }
        }
        for frame in state.queued_frames {
            // Best-effort replay of frames that never reached the wire.
            let _ = conn.enqueue_frame(frame);
        }
        info!(connection_id = %conn.id(), client_id = %client_id, "client state restored");
        true
    }

    // -----------------------------------------------------------------------
    // Event-loop internals
    // -----------------------------------------------------------------------

    async fn handle_register(&self, conn: Arc<Connection>) {
        if self.config.max_connections_per_hub > 0
            && self.connections.read().await.len() >= self.config.max_connections_per_hub
        {
            warn!(connection_id = %conn.id(), limit = self.config.max_connections_per_hub, "hub at capacity, rejecting connection");
            conn.queue.close();
            conn.signal_close();
            self.metrics.connection_rejected();
            return;
        }

        self.connections
            .write()
            .await
            .insert(conn.id().to_owned(), conn.clone());
        self.metrics.connection_registered(conn.id());
        info!(connection_id = %conn.id(), route = %conn.route_pattern(), "connection registered");

        let callbacks = self.callbacks_for(&self.connect_callbacks, &self.connect_route_callbacks, &conn);
        for cb in callbacks {
            if let Err(e) = cb(conn.clone()).await {
                warn!(connection_id = %conn.id(), error = %e, "connect callback failed");
                self.metrics.handler_error();
            }
        }
    }

    async fn handle_unregister(&self, conn: Arc<Connection>) {
        if self
            .connections
            .write()
            .await
            .remove(conn.id())
            .is_none()
        {
            // Duplicate unregister, or a connection that was rejected
            // before registration.
            conn.queue.close();
            return;
        }

        conn.signal_close();
        conn.queue.close();

        let rooms = conn.rooms();
        for room in &rooms {
            if let Some(r) = self.rooms.get_room(room).await {
                r.remove(conn.id()).await;
            }
        }
        conn.clear_rooms();
        self.metrics.connection_closed(conn.id());

        if self.config.enable_reconnection && self.config.preserve_client_state {
            let attrs = conn.attrs();
            let client_id = attrs
                .get("clientID")
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| conn.id().to_owned());
            self.state.save(client_id, attrs, rooms, conn.queue.drain());
        }

        info!(connection_id = %conn.id(), "connection unregistered");

        let callbacks = self.callbacks_for(
            &self.disconnect_callbacks,
            &self.disconnect_route_callbacks,
            &conn,
        );
        for cb in callbacks {
            if let Err(e) = cb(conn.clone()).await {
                warn!(connection_id = %conn.id(), error = %e, "disconnect callback failed");
                self.metrics.handler_error();
            }
        }
    }

    async fn handle_message(&self, ctx: MessageContext) {
        let kind = ctx.envelope.kind;
        match self.handlers.dispatch(ctx).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(kind = %kind, "no handler registered for message");
                self.metrics.message_failed();
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "handler error, dispatch halted for message");
                self.metrics.handler_error();
            }
        }
    }

    async fn handle_broadcast_all(&self, frame: Vec<u8>, exclude: Option<String>) {
        let targets: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        for conn in targets {
            if exclude.as_deref() == Some(conn.id()) {
                continue;
            }
            match conn.enqueue_frame(frame.clone()) {
                Ok(()) => {}
                Err(EnqueueError::Full) => {
                    self.metrics.queue_overflow();
                    // Per-connection sends apply the configured strategy;
                    // the broadcast loop instead treats a full queue as a
                    // dead peer so it can never stall.
                    warn!(connection_id = %conn.id(), "send queue full during broadcast-all, closing connection");
                    self.handle_unregister(conn).await;
                }
                Err(EnqueueError::Closed) => {}
            }
        }
    }

    async fn handle_broadcast_room(&self, room: &str, frame: Vec<u8>, exclude: Option<String>) {
        match self.rooms.get_room(room).await {
            Some(r) => r.broadcast(&frame, exclude.as_deref()).await,
            None => debug!(room = %room, "broadcast to unknown room dropped"),
        }
    }

    /// Global callbacks first, then the ones scoped to the
    /// connection's route pattern, in registration order.
    fn callbacks_for(
        &self,
        global: &RwLock<Vec<ConnectionCallback>>,
        by_route: &RwLock<HashMap<String, Vec<ConnectionCallback>>>,
        conn: &Arc<Connection>,
    ) -> Vec<ConnectionCallback> {
        let mut callbacks = global.read().expect("callback table poisoned").clone();
        if let Some(scoped) = by_route
            .read()
            .expect("callback table poisoned")
            .get(conn.route_pattern())
        {
            callbacks.extend(scoped.iter().cloned());
        }
        callbacks
    }
}

async fn event_loop(hub: Arc<Hub>, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    info!("hub event loop started");
    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register(conn) => hub.handle_register(conn).await,
            HubCommand::Unregister(conn) => hub.handle_unregister(conn).await,
            HubCommand::Message(ctx) => hub.handle_message(ctx).await,
            HubCommand::BroadcastAll { frame, exclude } => {
                hub.handle_broadcast_all(frame, exclude).await;
            }
            HubCommand::BroadcastRoom {
                room,
                frame,
                exclude,
            } => hub.handle_broadcast_room(&room, frame, exclude).await,
            HubCommand::Join { connection, room } => {
                if let Err(e) = hub.rooms.add_to_room(&room, connection).await {
                    warn!(room = %room, error = %e, "join via hub channel failed");
                }
            }
            HubCommand::Leave { connection, room } => {
                hub.rooms.remove_from_room(&room, &connection).await;
            }
            HubCommand::Shutdown => break,
        }
    }
    info!("hub event loop stopped");
}
