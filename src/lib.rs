//! relay-hub: a real-time WebSocket messaging runtime.
//!
//! The hub manages a fleet of long-lived bidirectional sessions,
//! routes typed envelopes to registered handlers, groups connections
//! into named rooms, enforces heartbeat liveness, absorbs bursts
//! through bounded per-connection send queues, and preserves client
//! state across brief disconnections so reconnecting clients resume
//! their rooms and attributes.
//!
//! Hosts embed it behind an axum route:
//!
//! ```rust,no_run
//! use relay_hub::{Hub, HubConfig, build_router};
//!
//! # async fn example() {
//! let hub = Hub::new(HubConfig::default());
//! hub.run().await;
//! let app = build_router(hub.clone());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//! axum::serve(listener, app).await.unwrap();
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hub;
pub mod metrics;
pub mod room;
pub mod send_queue;
pub mod state_store;
pub mod upgrade;

pub use config::{HubConfig, QueueStrategy};
pub use connection::Connection;
pub use error::HubError;
pub use handler::{Handler, HandlerRegistry, MessageContext, handler};
pub use hub::{ConnectionCallback, Hub, connection_callback};
pub use metrics::{ConnectionMetrics, HubMetrics, MetricsSnapshot};
pub use relay_protocol::{Envelope, MessageKind};
pub use room::{Room, RoomManager};
pub use state_store::{PreservedState, StateStore};
pub use upgrade::{build_router, handle_upgrade};
