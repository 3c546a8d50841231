//! HTTP upgrade seam: origin gate, connection creation, loop spawn.
//!
//! The hosting HTTP layer mounts [`handle_upgrade`] (or uses
//! [`build_router`] directly).  An accepted upgrade creates a
//! connection with a random 128-bit hex id, registers it with the hub,
//! and drives the read/write loops until the session ends.

use crate::connection::{self, Connection};
use crate::hub::{Hub, connection_callback};
use crate::metrics::MetricsSnapshot;
use axum::Json;
use axum::Router;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{MatchedPath, RawPathParams, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Origin gate
// ---------------------------------------------------------------------------

/// Decide whether an upgrade request passes the origin check.
///
/// Rules, in order: no Origin header allows; a `*` entry in the
/// allow-list allows anything (logged as a warning); a case-insensitive
/// allow-list match allows; with an empty allow-list, the Origin's host
/// suffix must equal the request Host; everything else is denied.
pub(crate) fn origin_allowed(
    origin: Option<&str>,
    host: Option<&str>,
    allowed_origins: &[String],
) -> bool {
    let Some(origin) = origin.filter(|o| !o.is_empty()) else {
        return true;
    };
    if allowed_origins.iter().any(|a| a == "*") {
        warn!(origin = %origin, "wildcard origin allow-list in effect, accepting any origin");
        return true;
    }
    if allowed_origins.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
        return true;
    }
    if allowed_origins.is_empty() {
        let Some(host) = host.filter(|h| !h.is_empty()) else {
            return false;
        };
        return origin_host(origin)
            .to_ascii_lowercase()
            .ends_with(&host.to_ascii_lowercase());
    }
    false
}

/// The host[:port] part of an Origin value like `https://a.example:8443`.
fn origin_host(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

// ---------------------------------------------------------------------------
// Upgrade handler
// ---------------------------------------------------------------------------

/// Axum handler for the WebSocket upgrade.
pub async fn handle_upgrade(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    matched_path: MatchedPath,
    params: RawPathParams,
    headers: HeaderMap,
) -> Response {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, host, &hub.config().allowed_origins) {
        warn!(origin = origin.unwrap_or_default(), "upgrade denied by origin check");
        return StatusCode::FORBIDDEN.into_response();
    }

    let route_pattern = matched_path.as_str().to_owned();
    let path_params: HashMap<String, String> = params
        .iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

    ws.max_message_size(hub.config().max_message_size)
        .on_upgrade(move |socket| serve_socket(socket, hub, route_pattern, path_params))
}

async fn serve_socket(
    socket: WebSocket,
    hub: Arc<Hub>,
    route_pattern: String,
    path_params: HashMap<String, String>,
) {
    let conn = Connection::new(&hub, route_pattern, path_params);
    info!(connection_id = %conn.id(), route = %conn.route_pattern(), "websocket upgraded");
    hub.register(conn.clone());

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(connection::write_loop(conn.clone(), sink));
    connection::read_loop(conn, stream).await;
    let _ = writer.await;
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Mount the hub's endpoints: `/ws`, `/ws/{room}` (auto-joins the room
/// from the path), `/healthz`, and a metrics snapshot.
pub fn build_router(hub: Arc<Hub>) -> Router {
    hub.on_connect_route(
        "/ws/{room}",
        connection_callback(|conn| async move {
            if let Some(room) = conn.path_param("room").map(str::to_owned) {
                conn.join(&room).await?;
            }
            Ok(())
        }),
    );

    Router::new()
        .route("/ws", get(handle_upgrade))
        .route("/ws/{room}", get(handle_upgrade))
        .route("/healthz", get(healthz))
        .route("/api/v1/metrics", get(metrics_snapshot))
        .with_state(hub)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_snapshot(State(hub): State<Arc<Hub>>) -> Json<MetricsSnapshot> {
    Json(hub.metrics().snapshot())
}
