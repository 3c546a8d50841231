//! Hub error kinds.
//!
//! I/O failures terminate the affected loop and surface through metrics
//! and logs, never through these variants; `HubError` is the caller-facing
//! surface for queue, room and registry operations plus boot-time config
//! validation.

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The connection is terminal (or its queue is closed); no further
    /// sends will be accepted.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("room not found: {0}")]
    RoomNotFound(String),
    #[error("room is full: {0}")]
    RoomFull(String),
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),
    /// Boot-time configuration failure, returned to the initializer.
    #[error("config: {0}")]
    Config(String),
    /// A user handler failed (or panicked inside the recovery boundary).
    #[error("handler: {0}")]
    Handler(String),
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::InvalidMessage(e.to_string())
    }
}
