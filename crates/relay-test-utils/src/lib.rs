// relay-test-utils: shared test utilities for the hub integration suites.
//
// Provides a mock WebSocket client for end-to-end testing against a
// running hub router.

pub mod mock_ws_client;

pub use mock_ws_client::MockWsClient;
