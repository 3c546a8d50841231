//! Hub metrics: lock-free global counters, per-connection records, and
//! point-in-time snapshots.
//!
//! Global counters are atomics; the per-connection records live under a
//! single map lock.  A snapshot is a copy — counters may advance while
//! it is being built.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

// ---------------------------------------------------------------------------
// Per-connection record
// ---------------------------------------------------------------------------

/// Counters for one connection, kept under the registry map lock.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub missed_pongs: u64,
    pub connected_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ConnectionMetrics {
    fn new() -> Self {
        ConnectionMetrics {
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            errors: 0,
            missed_pongs: 0,
            connected_at: Utc::now(),
            last_message_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// HubMetrics
// ---------------------------------------------------------------------------

/// Global hub counters.  All mutation paths are no-ops when metrics are
/// disabled in config; `snapshot()` still works and reports zeros.
#[derive(Debug)]
pub struct HubMetrics {
    enabled: bool,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,

    active_connections: AtomicU64,
    total_connections: AtomicU64,
    disconnected_connections: AtomicU64,
    rejected_connections: AtomicU64,

    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_failed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    read_errors: AtomicU64,
    write_errors: AtomicU64,
    handler_errors: AtomicU64,

    active_rooms: AtomicU64,
    missed_pongs: AtomicU64,
    successful_pongs: AtomicU64,
    queue_overflows: AtomicU64,
    dropped_messages: AtomicU64,

    /// Unix millis of the most recent send or receive; 0 = never.
    last_message_unix_ms: AtomicI64,

    connections: Mutex<HashMap<String, ConnectionMetrics>>,
}

impl HubMetrics {
    pub fn new(enabled: bool) -> Self {
        HubMetrics {
            enabled,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            disconnected_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            active_rooms: AtomicU64::new(0),
            missed_pongs: AtomicU64::new(0),
            successful_pongs: AtomicU64::new(0),
            queue_overflows: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
            last_message_unix_ms: AtomicI64::new(0),
            connections: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    pub fn connection_registered(&self, id: &str) {
        if !self.enabled {
            return;
        }
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .expect("metrics map poisoned")
            .insert(id.to_owned(), ConnectionMetrics::new());
    }

    pub fn connection_closed(&self, id: &str) {
        if !self.enabled {
            return;
        }
        // Saturating decrement: a rejected connection never registered.
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.disconnected_connections.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .expect("metrics map poisoned")
            .remove(id);
    }

    pub fn connection_rejected(&self) {
        if self.enabled {
            self.rejected_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    // -----------------------------------------------------------------------
    // Message flow
    // -----------------------------------------------------------------------

    pub fn message_sent(&self, id: &str, bytes: usize) {
        if !self.enabled {
            return;
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.stamp_last_message();
        if let Some(rec) = self
            .connections
            .lock()
            .expect("metrics map poisoned")
            .get_mut(id)
        {
            rec.messages_sent += 1;
            rec.bytes_sent += bytes as u64;
            rec.last_message_at = Some(Utc::now());
        }
    }

    pub fn message_received(&self, id: &str, bytes: usize) {
        if !self.enabled {
            return;
        }
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.stamp_last_message();
        if let Some(rec) = self
            .connections
            .lock()
            .expect("metrics map poisoned")
            .get_mut(id)
        {
            rec.messages_received += 1;
            rec.bytes_received += bytes as u64;
            rec.last_message_at = Some(Utc::now());
        }
    }

    pub fn message_failed(&self) {
        if self.enabled {
            self.messages_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn stamp_last_message(&self) {
        self.last_message_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    // -----------------------------------------------------------------------
    // Errors and liveness
    // -----------------------------------------------------------------------

    pub fn read_error(&self) {
        if self.enabled {
            self.read_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn write_error(&self) {
        if self.enabled {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn handler_error(&self) {
        if self.enabled {
            self.handler_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// An unparseable envelope or similar per-connection fault.
    pub fn connection_error(&self, id: &str) {
        if !self.enabled {
            return;
        }
        if let Some(rec) = self
            .connections
            .lock()
            .expect("metrics map poisoned")
            .get_mut(id)
        {
            rec.errors += 1;
        }
    }

    pub fn missed_pong(&self, id: &str) {
        if !self.enabled {
            return;
        }
        self.missed_pongs.fetch_add(1, Ordering::Relaxed);
        if let Some(rec) = self
            .connections
            .lock()
            .expect("metrics map poisoned")
            .get_mut(id)
        {
            rec.missed_pongs += 1;
        }
    }

    pub fn successful_pong(&self) {
        if self.enabled {
            self.successful_pongs.fetch_add(1, Ordering::Relaxed);
        }
    }

    // -----------------------------------------------------------------------
    // Rooms and queues
    // -----------------------------------------------------------------------

    pub fn room_created(&self) {
        if self.enabled {
            self.active_rooms.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn room_deleted(&self) {
        if self.enabled {
            let _ = self
                .active_rooms
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    pub fn queue_overflow(&self) {
        if self.enabled {
            self.queue_overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn message_dropped(&self) {
        if self.enabled {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Copy of one connection's record, if it is still registered.
    pub fn connection_metrics(&self, id: &str) -> Option<ConnectionMetrics> {
        self.connections
            .lock()
            .expect("metrics map poisoned")
            .get(id)
            .cloned()
    }

    /// Point-in-time copy of every counter plus derived rates.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.started_at.elapsed().as_secs_f64();
        let sent = self.messages_sent.load(Ordering::Relaxed);
        let received = self.messages_received.load(Ordering::Relaxed);
        let total = self.total_connections.load(Ordering::Relaxed);
        let last_ms = self.last_message_unix_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            started_at: self.started_at_utc,
            uptime_seconds: uptime,
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: total,
            disconnected_connections: self.disconnected_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            messages_sent: sent,
            messages_received: received,
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            active_rooms: self.active_rooms.load(Ordering::Relaxed),
            missed_pongs: self.missed_pongs.load(Ordering::Relaxed),
            successful_pongs: self.successful_pongs.load(Ordering::Relaxed),
            queue_overflows: self.queue_overflows.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            last_message_at: (last_ms > 0).then(|| DateTime::from_timestamp_millis(last_ms)).flatten(),
            messages_per_second: if uptime > 0.0 {
                (sent + received) as f64 / uptime
            } else {
                0.0
            },
            connections_per_second: if uptime > 0.0 { total as f64 / uptime } else { 0.0 },
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only copy of the hub counters at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub disconnected_connections: u64,
    pub rejected_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_failed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub read_errors: u64,
    pub write_errors: u64,
    pub handler_errors: u64,
    pub active_rooms: u64,
    pub missed_pongs: u64,
    pub successful_pongs: u64,
    pub queue_overflows: u64,
    pub dropped_messages: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub messages_per_second: f64,
    pub connections_per_second: f64,
}
