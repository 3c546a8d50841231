//! Relay server configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides
//! beyond the config path itself.  Every field is optional and falls
//! back to the hub defaults, so an empty file is a valid config.
//!
//! # Example
//! ```toml
//! schema_version = 1
//!
//! [server]
//! bind = "0.0.0.0:8080"
//!
//! [hub]
//! allowed_origins = ["https://app.example"]
//! max_connections = 10000
//! heartbeat_interval_secs = 30
//! message_queue_strategy = "drop_oldest"
//! ```

use relay_hub::{HubConfig, QueueStrategy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:8080".to_owned(),
            hub: HubConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    hub: Option<RawHubConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHubConfig {
    allowed_origins: Option<Vec<String>>,
    max_connections: Option<usize>,
    max_connections_per_room: Option<usize>,
    enable_heartbeat: Option<bool>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
    pong_wait_timeout_secs: Option<u64>,
    max_missed_pongs: Option<u32>,
    enable_reconnection: Option<bool>,
    preserve_client_state: Option<bool>,
    reconnection_timeout_secs: Option<u64>,
    max_reconnection_time_secs: Option<u64>,
    message_queue_size: Option<usize>,
    message_queue_strategy: Option<String>,
    max_message_size: Option<usize>,
    write_wait_secs: Option<u64>,
    read_wait_secs: Option<u64>,
    enable_metrics: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load server config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load server config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    if let Some(v) = raw.schema_version
        && v != 1
    {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            v
        )));
    }

    let bind = raw
        .server
        .and_then(|s| s.bind)
        .unwrap_or_else(|| "0.0.0.0:8080".to_owned());

    let defaults = HubConfig::default();
    let hub = match raw.hub {
        Some(h) => HubConfig {
            allowed_origins: h.allowed_origins.unwrap_or_default(),
            max_connections_per_hub: h.max_connections.unwrap_or(defaults.max_connections_per_hub),
            max_connections_per_room: h
                .max_connections_per_room
                .unwrap_or(defaults.max_connections_per_room),
            enable_heartbeat: h.enable_heartbeat.unwrap_or(defaults.enable_heartbeat),
            heartbeat_interval: secs_or(h.heartbeat_interval_secs, defaults.heartbeat_interval),
            heartbeat_timeout: secs_or(h.heartbeat_timeout_secs, defaults.heartbeat_timeout),
            pong_wait_timeout: secs_or(h.pong_wait_timeout_secs, defaults.pong_wait_timeout),
            max_missed_pongs: h.max_missed_pongs.unwrap_or(defaults.max_missed_pongs),
            enable_reconnection: h.enable_reconnection.unwrap_or(defaults.enable_reconnection),
            preserve_client_state: h
                .preserve_client_state
                .unwrap_or(defaults.preserve_client_state),
            reconnection_timeout: secs_or(
                h.reconnection_timeout_secs,
                defaults.reconnection_timeout,
            ),
            max_reconnection_time: secs_or(
                h.max_reconnection_time_secs,
                defaults.max_reconnection_time,
            ),
            message_queue_size: h.message_queue_size.unwrap_or(defaults.message_queue_size),
            message_queue_strategy: h
                .message_queue_strategy
                .as_deref()
                .map_or(defaults.message_queue_strategy, QueueStrategy::parse_or_default),
            max_message_size: h.max_message_size.unwrap_or(defaults.max_message_size),
            write_wait: secs_or(h.write_wait_secs, defaults.write_wait),
            read_wait: secs_or(h.read_wait_secs, defaults.read_wait),
            enable_metrics: h.enable_metrics.unwrap_or(defaults.enable_metrics),
        },
        None => defaults,
    };

    Ok(ServerConfig { bind, hub })
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
