//! Preserved-state save on disconnect and restore on reconnection.

use relay_hub::{Hub, HubConfig};
use relay_test_utils::MockWsClient;
use serde_json::json;
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
async fn a_reconnecting_client_resumes_attributes_and_rooms() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let url = format!("ws://{}/ws", addr);

    let mut client = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;

    let conn = hub.connections().await.into_iter().next().unwrap();
    conn.set_attr("clientID", json!("abc"));
    conn.set_attr("username", json!("alice"));
    client
        .send_text(r#"{"type":"join_room","room":"r1"}"#)
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(2), client.recv_json())
        .await
        .expect("join confirmation")
        .unwrap();
    assert_eq!(reply["type"], json!("join_room_success"));

    client.close().await.unwrap();
    wait_for_connections(&hub, 0).await;
    assert!(hub.state_store().contains("abc"), "state saved under the client id");

    // Reconnect within the window and restore by client id.
    let _client2 = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;
    let reborn = hub.connections().await.into_iter().next().unwrap();
    assert!(hub.restore_connection(&reborn, "abc").await);

    assert_eq!(reborn.get_attr("username"), Some(json!("alice")));
    assert_eq!(reborn.get_attr("clientID"), Some(json!("abc")));
    assert!(reborn.in_room("r1"));
    assert!(
        !hub.state_store().contains("abc"),
        "restoration consumes the record"
    );

    hub.shutdown().await;
}

#[tokio::test]
async fn restore_fails_after_the_reconnection_window() {
    let (hub, addr) = start_hub(HubConfig {
        // Keep the TTL reaper out of the way; age out via the max.
        reconnection_timeout: Duration::from_secs(30),
        max_reconnection_time: Duration::from_millis(50),
        ..HubConfig::default()
    })
    .await;
    let url = format!("ws://{}/ws", addr);

    let mut client = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;
    hub.connections().await[0].set_attr("clientID", json!("abc"));
    client.close().await.unwrap();
    wait_for_connections(&hub, 0).await;
    assert!(hub.state_store().contains("abc"));

    tokio::time::sleep(Duration::from_millis(120)).await;

    let _client2 = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;
    let reborn = hub.connections().await.into_iter().next().unwrap();
    assert!(!hub.restore_connection(&reborn, "abc").await);
    assert!(
        !hub.state_store().contains("abc"),
        "a stale record is deleted by the failed restore"
    );

    hub.shutdown().await;
}

#[tokio::test]
async fn preserved_state_expires_on_its_own() {
    let (hub, addr) = start_hub(HubConfig {
        reconnection_timeout: Duration::from_millis(40),
        ..HubConfig::default()
    })
    .await;
    let url = format!("ws://{}/ws", addr);

    let mut client = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;
    hub.connections().await[0].set_attr("clientID", json!("abc"));
    client.close().await.unwrap();
    wait_for_connections(&hub, 0).await;
    assert!(hub.state_store().contains("abc"));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while hub.state_store().contains("abc") {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expirer should have removed the record"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    hub.shutdown().await;
}
