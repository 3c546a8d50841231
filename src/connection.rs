//! One client session: identity, send queue, liveness, room
//! membership, and the read/write loops.
//!
//! Each connection runs two sibling tasks.  The read loop owns the
//! inbound half of the socket and feeds parsed envelopes to the hub;
//! the write loop owns the outbound half and drains the send queue,
//! coalescing already-queued frames into newline-delimited batches.
//! They share only the queue and small atomic/mutex fields, and both
//! funnel termination through [`Connection::close`], which delivers
//! exactly one unregister to the hub.

use crate::config::{HubConfig, QueueStrategy};
use crate::error::HubError;
use crate::hub::Hub;
use crate::metrics::HubMetrics;
use crate::send_queue::{EnqueueError, SendQueue};
use axum::extract::ws::{Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use rand::RngCore;
use rand::rngs::OsRng;
use relay_protocol::Envelope;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 128-bit cryptographically random hex id.
fn random_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct Connection {
    id: String,
    hub: Weak<Hub>,
    pub(crate) config: Arc<HubConfig>,
    pub(crate) metrics: Arc<HubMetrics>,
    pub(crate) queue: SendQueue,
    attributes: Mutex<HashMap<String, Value>>,
    rooms: Mutex<HashSet<String>>,
    missed_pongs: AtomicU32,
    last_pong: Mutex<Instant>,
    /// The route pattern this connection matched at upgrade time,
    /// e.g. `/ws` or `/ws/{room}`.  Scopes route-specific callbacks.
    route_pattern: String,
    path_params: HashMap<String, String>,
    close_tx: watch::Sender<bool>,
    unregister_sent: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        hub: &Arc<Hub>,
        route_pattern: impl Into<String>,
        path_params: HashMap<String, String>,
    ) -> Arc<Self> {
        let config = hub.config_arc();
        let (close_tx, _) = watch::channel(false);
        Arc::new(Connection {
            id: random_id(),
            hub: Arc::downgrade(hub),
            metrics: hub.metrics_arc(),
            queue: SendQueue::new(config.message_queue_size),
            config,
            attributes: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashSet::new()),
            missed_pongs: AtomicU32::new(0),
            last_pong: Mutex::new(Instant::now()),
            route_pattern: route_pattern.into(),
            path_params,
            close_tx,
            unregister_sent: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hub(&self) -> Option<Arc<Hub>> {
        self.hub.upgrade()
    }

    pub fn route_pattern(&self) -> &str {
        &self.route_pattern
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Enqueue a frame under the configured backpressure strategy.
    ///
    /// `drop_oldest` evicts the head of the queue to make room;
    /// `drop_newest` silently drops `frame` (reported as success);
    /// `block` suspends until space frees up.  Fails with
    /// `ConnectionClosed` once the connection is terminal.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), HubError> {
        match self.config.message_queue_strategy {
            QueueStrategy::DropOldest => match self.queue.push_evict_oldest(frame) {
                Ok(None) => Ok(()),
                Ok(Some(_evicted)) => {
                    self.metrics.message_dropped();
                    debug!(connection_id = %self.id, "queue full, dropped oldest frame");
                    Ok(())
                }
                Err(EnqueueError::Full) => {
                    self.metrics.queue_overflow();
                    Err(HubError::ConnectionClosed)
                }
                Err(EnqueueError::Closed) => Err(HubError::ConnectionClosed),
            },
            QueueStrategy::DropNewest => match self.queue.try_push(frame) {
                Ok(()) => Ok(()),
                Err(EnqueueError::Full) => {
                    self.metrics.message_dropped();
                    debug!(connection_id = %self.id, "queue full, dropped newest frame");
                    Ok(())
                }
                Err(EnqueueError::Closed) => Err(HubError::ConnectionClosed),
            },
            QueueStrategy::Block => self
                .queue
                .push_blocking(frame)
                .await
                .map_err(|_| HubError::ConnectionClosed),
        }
    }

    /// Encode `value` and enqueue it under the configured strategy.
    pub async fn send_json(&self, value: &Value) -> Result<(), HubError> {
        let text = serde_json::to_string(value)?;
        self.send(text.into_bytes()).await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), HubError> {
        let text = envelope.encode()?;
        self.send(text.into_bytes()).await
    }

    /// Plain non-blocking enqueue, bypassing the strategy.  Used by
    /// broadcast paths where full-queue policy is the caller's call.
    pub(crate) fn enqueue_frame(&self, frame: Vec<u8>) -> Result<(), EnqueueError> {
        self.queue.try_push(frame)
    }

    // -----------------------------------------------------------------------
    // Rooms and attributes
    // -----------------------------------------------------------------------

    /// Join a room through the hub's room manager (synchronous path:
    /// the membership is visible as soon as this returns).
    pub async fn join(self: &Arc<Self>, room: &str) -> Result<(), HubError> {
        let hub = self.hub().ok_or(HubError::ConnectionClosed)?;
        hub.rooms().add_to_room(room, self.clone()).await
    }

    pub async fn leave(self: &Arc<Self>, room: &str) -> Result<(), HubError> {
        let hub = self.hub().ok_or(HubError::ConnectionClosed)?;
        hub.rooms().remove_from_room(room, self).await;
        Ok(())
    }

    pub fn rooms(&self) -> Vec<String> {
        self.rooms
            .lock()
            .expect("room set poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.lock().expect("room set poisoned").contains(room)
    }

    pub(crate) fn note_joined(&self, room: &str) {
        self.rooms
            .lock()
            .expect("room set poisoned")
            .insert(room.to_owned());
    }

    pub(crate) fn note_left(&self, room: &str) {
        self.rooms.lock().expect("room set poisoned").remove(room);
    }

    pub(crate) fn clear_rooms(&self) {
        self.rooms.lock().expect("room set poisoned").clear();
    }

    pub fn get_attr(&self, key: &str) -> Option<Value> {
        self.attributes
            .lock()
            .expect("attributes poisoned")
            .get(key)
            .cloned()
    }

    pub fn set_attr(&self, key: impl Into<String>, value: Value) {
        self.attributes
            .lock()
            .expect("attributes poisoned")
            .insert(key.into(), value);
    }

    /// Snapshot of the attribute mapping.
    pub fn attrs(&self) -> HashMap<String, Value> {
        self.attributes.lock().expect("attributes poisoned").clone()
    }

    pub(crate) fn set_attrs(&self, attrs: HashMap<String, Value>) {
        self.attributes
            .lock()
            .expect("attributes poisoned")
            .extend(attrs);
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    pub(crate) fn pong_received(&self) {
        self.missed_pongs.store(0, Ordering::Relaxed);
        *self.last_pong.lock().expect("last_pong poisoned") = Instant::now();
        self.metrics.successful_pong();
    }

    pub(crate) fn note_missed_pong(&self) -> u32 {
        self.metrics.missed_pong(&self.id);
        self.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    /// True unless heartbeat is enabled and the peer has gone quiet past
    /// the configured tolerance.
    pub fn is_healthy(&self) -> bool {
        if !self.config.enable_heartbeat {
            return true;
        }
        if self.missed_pongs.load(Ordering::Relaxed) > self.config.max_missed_pongs {
            return false;
        }
        self.last_pong.lock().expect("last_pong poisoned").elapsed()
            <= self.config.heartbeat_timeout
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Transition to terminal and deliver the (single) unregister.
    ///
    /// Both loops, the hub's shutdown, and application code may all call
    /// this; the unregister reaches the hub exactly once.
    pub fn close(self: &Arc<Self>) {
        self.signal_close();
        if self.unregister_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hub) = self.hub() {
            hub.unregister(self.clone());
        }
    }

    /// Wake both loops without touching the unregister guard.
    pub(crate) fn signal_close(&self) {
        let _ = self.close_tx.send(true);
    }

    pub(crate) fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Number of frames currently waiting in the send queue.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(hub: &Arc<Hub>) -> Arc<Self> {
        Connection::new(hub, "/ws", HashMap::new())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route_pattern", &self.route_pattern)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Drive the inbound half until the peer closes, a fatal error occurs,
/// the read deadline lapses, or the hub signals close.
pub(crate) async fn read_loop(conn: Arc<Connection>, mut stream: SplitStream<WebSocket>) {
    let mut close_rx = conn.close_signal();
    // With heartbeat on, inbound pongs re-arm the deadline every
    // interval; without it, fall back to the plain read wait.
    let read_deadline = if conn.config.enable_heartbeat {
        conn.config.pong_wait_timeout
    } else {
        conn.config.read_wait
    };

    loop {
        // The close may have been signaled before this task subscribed
        // (e.g. a capacity rejection processed first).
        if *close_rx.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            next = timeout(read_deadline, stream.next()) => match next {
                Err(_) => {
                    warn!(connection_id = %conn.id(), "read deadline exceeded, terminating");
                    conn.metrics.read_error();
                    break;
                }
                Ok(None) => {
                    debug!(connection_id = %conn.id(), "peer closed the stream");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(connection_id = %conn.id(), error = %e, "transport read error");
                    conn.metrics.read_error();
                    break;
                }
                Ok(Some(Ok(msg))) => {
                    if !handle_inbound(&conn, msg).await {
                        break;
                    }
                }
            }
        }
    }

    conn.close();
}

/// Returns false when the loop should end.
async fn handle_inbound(conn: &Arc<Connection>, msg: Message) -> bool {
    match msg {
        Message::Text(text) => {
            conn.metrics.message_received(conn.id(), text.len());
            ingest_payload(conn, text.as_str()).await
        }
        Message::Binary(bytes) => {
            conn.metrics.message_received(conn.id(), bytes.len());
            match std::str::from_utf8(&bytes) {
                Ok(text) => ingest_payload(conn, text).await,
                Err(_) => {
                    warn!(connection_id = %conn.id(), "non-UTF-8 binary frame, skipping");
                    conn.metrics.connection_error(conn.id());
                    true
                }
            }
        }
        Message::Pong(_) => {
            conn.pong_received();
            true
        }
        // The transport layer answers pings on our behalf.
        Message::Ping(_) => true,
        Message::Close(_) => {
            debug!(connection_id = %conn.id(), "close frame received");
            false
        }
    }
}

/// Parse a (possibly newline-coalesced) payload and push each envelope
/// to the hub.  Unparseable envelopes are logged, counted against the
/// connection, and skipped.
async fn ingest_payload(conn: &Arc<Connection>, payload: &str) -> bool {
    let Some(hub) = conn.hub() else {
        return false;
    };
    for part in relay_protocol::split_batch(payload) {
        match Envelope::decode(part) {
            Ok(mut envelope) => {
                envelope.connection_id = Some(conn.id().to_owned());
                hub.ingest(conn.clone(), envelope);
            }
            Err(e) => {
                warn!(connection_id = %conn.id(), error = %e, "invalid envelope, skipping");
                conn.metrics.connection_error(conn.id());
            }
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Write loop
// ---------------------------------------------------------------------------

/// Drain the send queue to the socket, multiplexed with the heartbeat
/// ticker.  When the hub closes the queue, a close frame is sent and
/// the loop exits.
pub(crate) async fn write_loop(conn: Arc<Connection>, mut sink: SplitSink<WebSocket, Message>) {
    let heartbeat_enabled = conn.config.enable_heartbeat;
    let mut heartbeat = tokio::time::interval(conn.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick completes immediately; swallow it so the
    // first heartbeat fires one full period after the upgrade.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = conn.queue.pop() => match frame {
                Some(first) => {
                    if !flush_frames(&conn, &mut sink, first).await {
                        break;
                    }
                }
                None => {
                    // Queue closed by the hub: orderly goodbye.
                    let _ = timeout(conn.config.write_wait, sink.send(Message::Close(None))).await;
                    break;
                }
            },
            _ = heartbeat.tick(), if heartbeat_enabled => {
                let missed = conn.note_missed_pong();
                if missed > conn.config.max_missed_pongs {
                    warn!(
                        connection_id = %conn.id(),
                        missed,
                        max = conn.config.max_missed_pongs,
                        "missed pong limit exceeded, terminating"
                    );
                    break;
                }
                let ping = Message::Ping(Vec::new().into());
                match timeout(conn.config.write_wait, sink.send(ping)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        conn.metrics.write_error();
                        break;
                    }
                }
            }
        }
    }

    info!(connection_id = %conn.id(), "write loop ended");
    conn.close();
}

/// Write `first` plus anything else already queued, coalescing runs of
/// UTF-8 frames into one newline-delimited text frame.  Returns false
/// on write failure.
async fn flush_frames(
    conn: &Arc<Connection>,
    sink: &mut SplitSink<WebSocket, Message>,
    first: Vec<u8>,
) -> bool {
    let mut frames = vec![first];
    while let Some(next) = conn.queue.try_pop() {
        frames.push(next);
    }

    let mut text_run: Vec<String> = Vec::new();
    for frame in frames {
        match String::from_utf8(frame) {
            Ok(text) => text_run.push(text),
            Err(invalid) => {
                if !flush_text_run(conn, sink, &mut text_run).await {
                    return false;
                }
                let bytes = invalid.into_bytes();
                let len = bytes.len();
                match timeout(conn.config.write_wait, sink.send(Message::Binary(bytes.into())))
                    .await
                {
                    Ok(Ok(())) => conn.metrics.message_sent(conn.id(), len),
                    _ => {
                        conn.metrics.write_error();
                        return false;
                    }
                }
            }
        }
    }
    flush_text_run(conn, sink, &mut text_run).await
}

async fn flush_text_run(
    conn: &Arc<Connection>,
    sink: &mut SplitSink<WebSocket, Message>,
    run: &mut Vec<String>,
) -> bool {
    if run.is_empty() {
        return true;
    }
    let joined = relay_protocol::join_batch(run);
    match timeout(conn.config.write_wait, sink.send(Message::Text(joined.into()))).await {
        Ok(Ok(())) => {
            for part in run.iter() {
                conn.metrics.message_sent(conn.id(), part.len());
            }
            run.clear();
            true
        }
        _ => {
            conn.metrics.write_error();
            false
        }
    }
}
