//! Hub configuration.
//!
//! All tunables in one struct with production defaults.  `normalized()`
//! is the validation pass: any non-positive duration or size falls back
//! to its default and the replacement is logged.  Hosts that read the
//! config from TOML deserialize a raw table first and convert (see the
//! relay-server binary).

use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// Queue strategy
// ---------------------------------------------------------------------------

/// What to do when a connection's send queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStrategy {
    /// Evict the oldest queued frame and retry the enqueue once.
    DropOldest,
    /// Silently drop the new frame (counted, reported as success).
    DropNewest,
    /// Suspend the caller until space is available.
    Block,
}

impl QueueStrategy {
    /// Parse the config-file spelling.  Empty or unknown strings fall
    /// back to `DropOldest`.
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "drop_newest" => QueueStrategy::DropNewest,
            "block" => QueueStrategy::Block,
            "drop_oldest" => QueueStrategy::DropOldest,
            "" => QueueStrategy::DropOldest,
            other => {
                warn!(strategy = %other, "unknown queue strategy, using drop_oldest");
                QueueStrategy::DropOldest
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStrategy::DropOldest => "drop_oldest",
            QueueStrategy::DropNewest => "drop_newest",
            QueueStrategy::Block => "block",
        }
    }
}

// ---------------------------------------------------------------------------
// HubConfig
// ---------------------------------------------------------------------------

/// Tunables for a hub instance.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Origin allow-list for the upgrade gate.  `*` permits any origin
    /// (logged as a warning).  Empty list: same-host origins only.
    pub allowed_origins: Vec<String>,
    /// 0 means unlimited.
    pub max_connections_per_hub: usize,
    /// Default capacity for rooms created on demand; 0 means unlimited.
    pub max_connections_per_room: usize,
    pub enable_heartbeat: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Read deadline; a transport pong or any inbound frame re-arms it.
    pub pong_wait_timeout: Duration,
    pub max_missed_pongs: u32,
    pub enable_reconnection: bool,
    pub preserve_client_state: bool,
    /// How long preserved state survives after disconnect.
    pub reconnection_timeout: Duration,
    /// Hard age limit on restoring preserved state.
    pub max_reconnection_time: Duration,
    /// Per-connection send queue capacity, in frames.
    pub message_queue_size: usize,
    pub message_queue_strategy: QueueStrategy,
    /// Inbound transport frame size limit, in bytes.
    pub max_message_size: usize,
    pub write_wait: Duration,
    pub read_wait: Duration,
    pub enable_metrics: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            allowed_origins: Vec::new(),
            max_connections_per_hub: 0,
            max_connections_per_room: 0,
            enable_heartbeat: true,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            pong_wait_timeout: Duration::from_secs(60),
            max_missed_pongs: 3,
            enable_reconnection: true,
            preserve_client_state: true,
            reconnection_timeout: Duration::from_secs(30),
            max_reconnection_time: Duration::from_secs(300),
            message_queue_size: 256,
            message_queue_strategy: QueueStrategy::DropOldest,
            max_message_size: 512 * 1024,
            write_wait: Duration::from_secs(10),
            read_wait: Duration::from_secs(60),
            enable_metrics: true,
        }
    }
}

impl HubConfig {
    /// Apply the validation rules: every non-positive duration or size
    /// is replaced by its default.  Replacements are logged so a
    /// misconfigured deployment is visible at boot.
    pub fn normalized(mut self) -> Self {
        let defaults = HubConfig::default();

        fn fix_duration(name: &str, value: &mut Duration, default: Duration) {
            if value.is_zero() {
                warn!(option = name, default_secs = default.as_secs(), "non-positive duration, using default");
                *value = default;
            }
        }

        fix_duration("heartbeat_interval", &mut self.heartbeat_interval, defaults.heartbeat_interval);
        fix_duration("heartbeat_timeout", &mut self.heartbeat_timeout, defaults.heartbeat_timeout);
        fix_duration("pong_wait_timeout", &mut self.pong_wait_timeout, defaults.pong_wait_timeout);
        fix_duration("reconnection_timeout", &mut self.reconnection_timeout, defaults.reconnection_timeout);
        fix_duration("max_reconnection_time", &mut self.max_reconnection_time, defaults.max_reconnection_time);
        fix_duration("write_wait", &mut self.write_wait, defaults.write_wait);
        fix_duration("read_wait", &mut self.read_wait, defaults.read_wait);

        if self.max_missed_pongs == 0 {
            warn!(option = "max_missed_pongs", default = defaults.max_missed_pongs, "non-positive, using default");
            self.max_missed_pongs = defaults.max_missed_pongs;
        }
        if self.message_queue_size == 0 {
            warn!(option = "message_queue_size", default = defaults.message_queue_size, "non-positive, using default");
            self.message_queue_size = defaults.message_queue_size;
        }
        if self.max_message_size == 0 {
            warn!(option = "max_message_size", default = defaults.max_message_size, "non-positive, using default");
            self.max_message_size = defaults.max_message_size;
        }

        self
    }
}
