//! The upgrade-time origin gate.

use relay_hub::{Hub, HubConfig};
use relay_test_utils::MockWsClient;
use std::sync::Arc;

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
async fn allow_listed_origins_pass_and_others_are_denied() {
    let (hub, addr) = start_hub(HubConfig {
        allowed_origins: vec!["https://a.example".to_owned()],
        ..HubConfig::default()
    })
    .await;
    let url = format!("ws://{}/ws", addr);

    let denied = MockWsClient::connect_with_origin(&url, "https://b.example").await;
    assert!(denied.is_err(), "b.example is not on the allow-list");

    let accepted = MockWsClient::connect_with_origin(&url, "https://a.example").await;
    assert!(accepted.is_ok(), "a.example is on the allow-list");

    // Case-insensitive match.
    let accepted = MockWsClient::connect_with_origin(&url, "HTTPS://A.EXAMPLE").await;
    assert!(accepted.is_ok());

    // No Origin header at all: allowed (non-browser client).
    let accepted = MockWsClient::connect(&url).await;
    assert!(accepted.is_ok());

    hub.shutdown().await;
}

#[tokio::test]
async fn wildcard_accepts_any_origin() {
    let (hub, addr) = start_hub(HubConfig {
        allowed_origins: vec!["*".to_owned()],
        ..HubConfig::default()
    })
    .await;
    let url = format!("ws://{}/ws", addr);

    let accepted = MockWsClient::connect_with_origin(&url, "https://anything.example").await;
    assert!(accepted.is_ok());

    hub.shutdown().await;
}

#[tokio::test]
async fn empty_allow_list_falls_back_to_same_host() {
    let (hub, addr) = start_hub(HubConfig::default()).await;
    let url = format!("ws://{}/ws", addr);

    // Origin host matches the request Host (ip:port) exactly.
    let accepted = MockWsClient::connect_with_origin(&url, &format!("http://{}", addr)).await;
    assert!(accepted.is_ok(), "same-host origin should pass");

    let denied = MockWsClient::connect_with_origin(&url, "https://elsewhere.example").await;
    assert!(denied.is_err(), "cross-host origin should be denied");

    hub.shutdown().await;
}
