// relay-protocol: wire envelope model and batch framing.
//
// Every application message is a UTF-8 JSON object with a top-level
// `type` field for discriminated deserialization.  Empty optional
// fields are omitted on write; unknown fields are ignored on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Message kinds
// ---------------------------------------------------------------------------

/// All envelope kinds in the v1 protocol.
///
/// Serialized in snake_case under the JSON key `type`:
///
/// ```json
/// { "type": "join_room", "room": "lobby" }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Binary,
    Json,
    Connect,
    Disconnect,
    Error,
    JoinRoom,
    LeaveRoom,
    Broadcast,
    Ping,
    Pong,
}

impl MessageKind {
    /// The wire name of this kind (the snake_case `type` value).
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Binary => "binary",
            MessageKind::Json => "json",
            MessageKind::Connect => "connect",
            MessageKind::Disconnect => "disconnect",
            MessageKind::Error => "error",
            MessageKind::JoinRoom => "join_room",
            MessageKind::LeaveRoom => "leave_room",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The application-level message record.
///
/// `timestamp` defaults to the receive time when the peer omits it, so
/// bare messages like `{"type":"ping"}` parse cleanly.  `metadata` is
/// created lazily by [`Envelope::set_metadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Application-defined routing name; takes precedence over `kind`
    /// at dispatch time when a handler is registered for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Target connection id for directed delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Source connection id; stamped by the hub on inbound messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Envelope {
    /// A bare envelope of the given kind, stamped with the current time.
    pub fn new(kind: MessageKind) -> Self {
        Envelope {
            kind,
            event: None,
            data: None,
            room: None,
            target: None,
            connection_id: None,
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    /// A `json`-kind envelope carrying `data`.
    pub fn json(data: Value) -> Self {
        let mut env = Envelope::new(MessageKind::Json);
        env.data = Some(data);
        env
    }

    /// An `error`-kind envelope with the standard `{error: <msg>}` body.
    pub fn error(message: &str) -> Self {
        let mut env = Envelope::new(MessageKind::Error);
        env.data = Some(serde_json::json!({ "error": message }));
        env
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_source(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Set a metadata entry, creating the mapping on first use.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
    }

    /// Look up a metadata entry; `None` when the mapping was never created.
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one JSON object from the wire.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

// ---------------------------------------------------------------------------
// Batch framing
// ---------------------------------------------------------------------------

/// Split a transport text frame into individual JSON objects.
///
/// Writers may coalesce several queued envelopes into one frame,
/// separated by a single `\n` (0x0A).  A frame holding one object has
/// no separator, so both forms pass through here.  Blank segments
/// (trailing newline) are dropped.
pub fn split_batch(frame: &str) -> impl Iterator<Item = &str> {
    frame.split('\n').filter(|s| !s.trim().is_empty())
}

/// Writer-side inverse of [`split_batch`].
pub fn join_batch<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Default-handler reply objects
// ---------------------------------------------------------------------------

/// Reply bodies sent by the built-in handlers.  These are plain JSON
/// objects (not envelopes); the `type` values are frozen.
pub mod reply {
    use serde_json::{Value, json};

    pub fn join_success(room: &str) -> Value {
        json!({ "type": "join_room_success", "room": room, "status": "joined" })
    }

    pub fn leave_success(room: &str) -> Value {
        json!({ "type": "leave_room_success", "room": room, "status": "left" })
    }

    pub fn error(message: &str) -> Value {
        json!({ "type": "error", "data": { "error": message } })
    }
}
