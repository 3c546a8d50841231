//! Graceful shutdown: every session drains and the event loop stops.

use relay_hub::{Hub, HubConfig, connection_callback};
use relay_test_utils::MockWsClient;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
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
async fn shutdown_closes_every_session_and_runs_disconnect_callbacks() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let d = disconnects.clone();
    hub.on_disconnect(connection_callback(move |_conn| {
        let d = d.clone();
        async move {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }));

    let url = format!("ws://{}/ws", addr);
    let mut a = MockWsClient::connect(&url).await.unwrap();
    let mut b = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 2).await;

    hub.shutdown().await;

    assert_eq!(hub.connection_count().await, 0);
    assert_eq!(disconnects.load(Ordering::SeqCst), 2);

    // Both clients observe the close.
    let a_out = timeout(Duration::from_secs(2), a.recv_json()).await;
    assert!(matches!(a_out, Ok(Err(_))), "client A should see the close");
    let b_out = timeout(Duration::from_secs(2), b.recv_json()).await;
    assert!(matches!(b_out, Ok(Err(_))), "client B should see the close");

    // Idempotent.
    hub.shutdown().await;
}

#[tokio::test]
async fn a_client_disconnect_cleans_up_rooms_and_counters() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let url = format!("ws://{}/ws", addr);

    let mut client = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;
    client
        .send_text(r#"{"type":"join_room","room":"r1"}"#)
        .await
        .unwrap();
    client.recv_json().await.unwrap();
    let room = hub.rooms().get_room("r1").await.expect("room exists");
    assert_eq!(room.len().await, 1);

    client.close().await.unwrap();
    wait_for_connections(&hub, 0).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !room.is_empty().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "room membership should be cleared on disconnect"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let snap = hub.metrics().snapshot();
    assert_eq!(snap.active_connections, 0);
    assert_eq!(snap.disconnected_connections, 1);

    hub.shutdown().await;
}
