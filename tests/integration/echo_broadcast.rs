//! End-to-end broadcast delivery through a live hub router.

use relay_hub::{Hub, HubConfig, MessageKind};
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
async fn broadcast_reaches_other_clients_but_not_the_sender() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let url = format!("ws://{}/ws", addr);

    let mut a = MockWsClient::connect(&url).await.unwrap();
    let mut b = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 2).await;

    a.send_text(r#"{"type":"broadcast","data":"hello"}"#)
        .await
        .unwrap();

    let envelope = timeout(Duration::from_secs(2), b.recv_envelope())
        .await
        .expect("B should receive the broadcast")
        .unwrap();
    assert_eq!(envelope.kind, MessageKind::Json);
    assert_eq!(envelope.data, Some(json!("hello")));
    assert!(envelope.connection_id.is_some(), "relay carries the source id");

    let echo = timeout(Duration::from_millis(200), a.recv_envelope()).await;
    assert!(echo.is_err(), "sender must not receive its own broadcast");

    hub.shutdown().await;
}

#[tokio::test]
async fn frames_from_one_task_arrive_in_send_order() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let url = format!("ws://{}/ws", addr);

    let mut client = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 1).await;
    let conn_id = hub.connections().await[0].id().to_owned();

    for n in 0..20 {
        hub.send_to(&conn_id, format!(r#"{{"n":{n}}}"#).into_bytes())
            .await
            .unwrap();
    }

    // Delivery may coalesce several frames into one transport frame;
    // the client unbatches, so order is all that is asserted here.
    for n in 0..20 {
        let value = timeout(Duration::from_secs(2), client.recv_json())
            .await
            .expect("frame should arrive")
            .unwrap();
        assert_eq!(value["n"], json!(n), "out-of-order delivery");
    }

    hub.shutdown().await;
}

#[tokio::test]
async fn metrics_count_the_traffic() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let url = format!("ws://{}/ws", addr);

    let mut a = MockWsClient::connect(&url).await.unwrap();
    let mut b = MockWsClient::connect(&url).await.unwrap();
    wait_for_connections(&hub, 2).await;

    a.send_text(r#"{"type":"broadcast","data":1}"#).await.unwrap();
    b.recv_envelope().await.unwrap();

    let snap = hub.metrics().snapshot();
    assert_eq!(snap.active_connections, 2);
    assert_eq!(snap.total_connections, 2);
    assert!(snap.messages_received >= 1);
    assert!(snap.messages_sent >= 1);
    assert!(snap.bytes_received > 0);
    assert!(snap.last_message_at.is_some());

    hub.shutdown().await;
}
