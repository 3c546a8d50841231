//! Message dispatch: kind- and event-keyed handler tables.
//!
//! Handlers registered under the same key run in registration order;
//! the first error halts dispatch for that message.  A non-empty event
//! name with registered handlers takes precedence over the kind table.
//! Each handler runs inside a recovery boundary so a panic becomes a
//! handler error instead of taking down the hub loop.

use crate::connection::Connection;
use crate::error::HubError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use relay_protocol::{Envelope, MessageKind, reply};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// A parsed inbound message paired with the connection it arrived on.
#[derive(Clone)]
pub struct MessageContext {
    pub connection: Arc<Connection>,
    pub envelope: Envelope,
}

pub type HandlerFuture = BoxFuture<'static, Result<(), HubError>>;
pub type Handler = Arc<dyn Fn(MessageContext) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a registrable [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HubError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    by_kind: RwLock<HashMap<MessageKind, Vec<Handler>>>,
    by_event: RwLock<HashMap<String, Vec<Handler>>>,
}

impl HandlerRegistry {
    /// An empty registry plus the default `join_room` / `leave_room` /
    /// `broadcast` / `ping` handlers.
    pub fn new() -> Self {
        let registry = HandlerRegistry {
            by_kind: RwLock::new(HashMap::new()),
            by_event: RwLock::new(HashMap::new()),
        };
        registry.install_defaults();
        registry
    }

    /// Append a handler for an envelope kind.
    pub fn on(&self, kind: MessageKind, h: Handler) {
        self.by_kind
            .write()
            .expect("handler table poisoned")
            .entry(kind)
            .or_default()
            .push(h);
    }

    /// Append a handler for an application-defined event name.
    pub fn on_event(&self, event: impl Into<String>, h: Handler) {
        self.by_event
            .write()
            .expect("handler table poisoned")
            .entry(event.into())
            .or_default()
            .push(h);
    }

    /// Remove every registration and reinstate the defaults.
    pub fn clear(&self) {
        self.by_kind.write().expect("handler table poisoned").clear();
        self.by_event.write().expect("handler table poisoned").clear();
        self.install_defaults();
    }

    /// Dispatch one message.  Returns `Ok(false)` when no handler is
    /// registered for the envelope (unknown kind, no event match).
    pub async fn dispatch(&self, ctx: MessageContext) -> Result<bool, HubError> {
        let handlers = self.handlers_for(&ctx.envelope);
        if handlers.is_empty() {
            return Ok(false);
        }
        for h in handlers {
            let fut = AssertUnwindSafe(h(ctx.clone())).catch_unwind();
            match fut.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(HubError::Handler("handler panicked".to_owned())),
            }
        }
        Ok(true)
    }

    /// Event handlers win over kind handlers when both could apply.
    fn handlers_for(&self, envelope: &Envelope) -> Vec<Handler> {
        if let Some(event) = envelope.event.as_deref()
            && !event.is_empty()
        {
            let by_event = self.by_event.read().expect("handler table poisoned");
            if let Some(list) = by_event.get(event)
                && !list.is_empty()
            {
                return list.clone();
            }
        }
        self.by_kind
            .read()
            .expect("handler table poisoned")
            .get(&envelope.kind)
            .cloned()
            .unwrap_or_default()
    }

    fn install_defaults(&self) {
        self.on(MessageKind::JoinRoom, handler(default_join_room));
        self.on(MessageKind::LeaveRoom, handler(default_leave_room));
        self.on(MessageKind::Broadcast, handler(default_broadcast));
        self.on(MessageKind::Ping, handler(default_ping));
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        HandlerRegistry::new()
    }
}

// ---------------------------------------------------------------------------
// Default handlers
// ---------------------------------------------------------------------------

fn room_name(envelope: &Envelope) -> Option<&str> {
    envelope.room.as_deref().filter(|r| !r.is_empty())
}

async fn default_join_room(ctx: MessageContext) -> Result<(), HubError> {
    let Some(room) = room_name(&ctx.envelope).map(str::to_owned) else {
        ctx.connection
            .send_envelope(&Envelope::error("join_room requires a room name"))
            .await?;
        return Ok(());
    };
    // Synchronous room-manager path: the membership is in place before
    // the confirmation is queued, so a follow-up room broadcast from
    // the same handler chain reaches the joiner.
    if let Err(e) = ctx.connection.join(&room).await {
        warn!(connection_id = %ctx.connection.id(), room = %room, error = %e, "join failed");
        ctx.connection
            .send_envelope(&Envelope::error(&e.to_string()))
            .await?;
        return Ok(());
    }
    ctx.connection.send_json(&reply::join_success(&room)).await
}

async fn default_leave_room(ctx: MessageContext) -> Result<(), HubError> {
    let Some(room) = room_name(&ctx.envelope).map(str::to_owned) else {
        ctx.connection
            .send_envelope(&Envelope::error("leave_room requires a room name"))
            .await?;
        return Ok(());
    };
    ctx.connection.leave(&room).await?;
    ctx.connection.send_json(&reply::leave_success(&room)).await
}

/// Relay the payload as a `json` envelope: to the named room when one
/// is present, otherwise to every connection.  The sender never hears
/// its own broadcast back.
async fn default_broadcast(ctx: MessageContext) -> Result<(), HubError> {
    let hub = ctx.connection.hub().ok_or(HubError::ConnectionClosed)?;
    let sender = ctx.connection.id().to_owned();

    let payload = ctx.envelope.data.clone().unwrap_or(Value::Null);
    let relay = Envelope::json(payload).with_source(sender.clone());
    let frame = relay.encode()?.into_bytes();

    match room_name(&ctx.envelope) {
        Some(room) => hub.broadcast_room(room, frame, Some(sender)),
        None => hub.broadcast_all(frame, Some(sender)),
    }
    Ok(())
}

/// Application-level ping: reply with a pong carrying the original
/// timestamp (transport ping/pong is handled separately by the
/// liveness machinery).
async fn default_ping(ctx: MessageContext) -> Result<(), HubError> {
    let mut pong = Envelope::new(MessageKind::Pong);
    pong.timestamp = ctx.envelope.timestamp;
    ctx.connection.send_envelope(&pong).await
}
