//! Heartbeat-based liveness: unresponsive peers are terminated within
//! the configured tolerance.

use futures_util::StreamExt;
use relay_hub::{Hub, HubConfig};
use relay_test_utils::MockWsClient;
use std::sync::Arc;
use std::time::Duration;

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

async fn wait_for_connections(hub: &Arc<Hub>, n: usize, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    while hub.connection_count().await != n {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {n} registered connections"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn fast_heartbeat() -> HubConfig {
    HubConfig {
        heartbeat_interval: Duration::from_millis(100),
        max_missed_pongs: 2,
        // Keep the read deadline out of the picture so the missed-pong
        // path is what terminates the connection.
        pong_wait_timeout: Duration::from_secs(30),
        ..HubConfig::default()
    }
}

#[tokio::test]
async fn a_silent_peer_is_terminated_within_the_tolerance() {
    let (hub, addr) = start_hub(fast_heartbeat()).await;

    // Connect without ever reading: transport pings are never answered
    // because auto-pong only happens when the client polls its stream.
    let (_ws, _response) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
    wait_for_connections(&hub, 1, Duration::from_secs(2)).await;

    // Termination bound: (max_missed_pongs + 1) * heartbeat_interval,
    // plus scheduling slack.
    wait_for_connections(&hub, 0, Duration::from_millis(3 * 100 + 700)).await;
    assert!(hub.metrics().snapshot().missed_pongs >= 3);

    hub.shutdown().await;
}

#[tokio::test]
async fn a_responsive_peer_stays_connected() {
    let (hub, addr) = start_hub(fast_heartbeat()).await;

    // Keep polling the stream; tungstenite answers server pings with
    // pongs as part of the read loop.
    let (ws, _response) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    let pump = tokio::spawn(async move {
        let (_write, mut read) = ws.split();
        while let Some(Ok(_msg)) = read.next().await {}
    });
    wait_for_connections(&hub, 1, Duration::from_secs(2)).await;

    // Several heartbeat periods pass; the peer must survive them all.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(hub.connection_count().await, 1);
    assert!(hub.metrics().snapshot().successful_pongs >= 1);

    hub.shutdown().await;
    pump.abort();
}

#[tokio::test]
async fn disabled_heartbeat_never_terminates_a_silent_peer() {
    let (hub, addr) = start_hub(HubConfig {
        enable_heartbeat: false,
        heartbeat_interval: Duration::from_millis(50),
        pong_wait_timeout: Duration::from_secs(30),
        ..HubConfig::default()
    })
    .await;

    let mut client = MockWsClient::connect(&format!("ws://{}/ws", addr))
        .await
        .unwrap();
    wait_for_connections(&hub, 1, Duration::from_secs(2)).await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hub.connection_count().await, 1);
    assert_eq!(hub.metrics().snapshot().missed_pongs, 0);

    client.close().await.unwrap();
    hub.shutdown().await;
}
