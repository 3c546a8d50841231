//! Hub connection-limit enforcement at registration time.

use relay_hub::{Hub, HubConfig};
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

async fn wait_for_connections(hub: &Arc<Hub>, n: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while hub.connection_count().await != n {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {n} registered connections"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn the_connection_after_the_limit_is_rejected_and_counted() {
    let (hub, addr) = start_hub(HubConfig {
        max_connections_per_hub: 1,
        ..HubConfig::default()
    })
    .await;
    let url = format!("ws://{}/ws", addr);

    let _first = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;

    // The upgrade itself succeeds; the hub then closes the transport
    // without accepting the connection.
    let mut second = MockWsClient::connect(&url).await.unwrap();
    let outcome = timeout(Duration::from_secs(2), second.recv_json()).await;
    assert!(
        matches!(outcome, Ok(Err(_))),
        "the rejected client should see its transport closed, got {outcome:?}"
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while hub.metrics().snapshot().rejected_connections != 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "rejection was never counted"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let snap = hub.metrics().snapshot();
    assert_eq!(snap.active_connections, 1);
    assert_eq!(snap.rejected_connections, 1);
    assert_eq!(snap.total_connections, 1, "a rejected connection never registers");

    hub.shutdown().await;
}

#[tokio::test]
async fn a_freed_slot_can_be_reused() {
    let (hub, addr) = start_hub(HubConfig {
        max_connections_per_hub: 1,
        ..HubConfig::default()
    })
    .await;
    let url = format!("ws://{}/ws", addr);

    let mut first = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;
    first.close().await.unwrap();
    wait_for_connections(&hub, 0).await;

    let _second = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;
    assert_eq!(hub.metrics().snapshot().rejected_connections, 0);

    hub.shutdown().await;
}
