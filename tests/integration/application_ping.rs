//! Application-level ping/pong (distinct from transport control frames).

use relay_hub::{Hub, HubConfig, MessageKind};
use relay_test_utils::MockWsClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn start_hub(config: HubConfig) -> (Arc<Hub>, std::net::SocketAddr) {
    let hub = Hub::new(config);
    hub.run().await;
    let router = relay_hub::build_router(hub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (hub, addr)
}

#[tokio::test]
async fn ping_elicits_a_pong_carrying_the_original_timestamp() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let mut client = MockWsClient::connect(&format!("ws://{}/ws", addr))
        .await
        .unwrap();

    client
        .send_text(r#"{"type":"ping","timestamp":"2025-01-01T00:00:00Z"}"#)
        .await
        .unwrap();

    let pong = timeout(Duration::from_secs(2), client.recv_envelope())
        .await
        .expect("pong should arrive")
        .unwrap();
    assert_eq!(pong.kind, MessageKind::Pong);
    assert_eq!(pong.timestamp.to_rfc3339(), "2025-01-01T00:00:00+00:00");

    hub.shutdown().await;
}

#[tokio::test]
async fn malformed_envelopes_are_skipped_not_fatal() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let mut client = MockWsClient::connect(&format!("ws://{}/ws", addr))
        .await
        .unwrap();

    client.send_text("{not json").await.unwrap();
    client.send_text(r#"{"type":"telepathy"}"#).await.unwrap();

    // The connection survives both bad frames.
    client
        .send_text(r#"{"type":"ping","timestamp":"2025-01-01T00:00:00Z"}"#)
        .await
        .unwrap();
    let pong = timeout(Duration::from_secs(2), client.recv_envelope())
        .await
        .expect("connection should still be alive")
        .unwrap();
    assert_eq!(pong.kind, MessageKind::Pong);

    hub.shutdown().await;
}

#[tokio::test]
async fn newline_batched_requests_are_each_dispatched() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let mut client = MockWsClient::connect(&format!("ws://{}/ws", addr))
        .await
        .unwrap();

    client
        .send_text(
            "{\"type\":\"ping\",\"timestamp\":\"2025-01-01T00:00:00Z\"}\n{\"type\":\"ping\",\"timestamp\":\"2025-01-01T00:00:01Z\"}",
        )
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), client.recv_envelope())
        .await
        .expect("first pong")
        .unwrap();
    let second = timeout(Duration::from_secs(2), client.recv_envelope())
        .await
        .expect("second pong")
        .unwrap();
    assert_eq!(first.timestamp.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    assert_eq!(second.timestamp.to_rfc3339(), "2025-01-01T00:00:01+00:00");

    hub.shutdown().await;
}
