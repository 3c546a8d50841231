//! Preserved client state for reconnection.
//!
//! When an enabled hub unregisters a connection it snapshots the
//! attributes, room names, and any frames still queued, keyed by
//! client id.  Each record arms a single-shot expirer; a record that
//! is overwritten before the timer fires survives, because the timer
//! only removes the exact generation it was armed for.  Restoration
//! is exactly-once: the record is removed on the way out, including
//! on a failed (stale) restore.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Snapshot of a terminated connection, keyed by client id.
#[derive(Debug, Clone)]
pub struct PreservedState {
    saved_at: Instant,
    pub attributes: HashMap<String, Value>,
    pub rooms: Vec<String>,
    /// Outbound frames that never reached the wire.
    pub queued_frames: Vec<Vec<u8>>,
}

pub struct StateStore {
    entries: Arc<Mutex<HashMap<String, PreservedState>>>,
    reconnection_timeout: Duration,
    max_reconnection_time: Duration,
}

impl StateStore {
    pub fn new(reconnection_timeout: Duration, max_reconnection_time: Duration) -> Self {
        StateStore {
            entries: Arc::new(Mutex::new(HashMap::new())),
            reconnection_timeout,
            max_reconnection_time,
        }
    }

    /// Insert or overwrite the record for `client_id` and arm its
    /// single-shot expirer.
    pub fn save(
        &self,
        client_id: String,
        attributes: HashMap<String, Value>,
        rooms: Vec<String>,
        queued_frames: Vec<Vec<u8>>,
    ) {
        let saved_at = Instant::now();
        self.entries.lock().expect("state store poisoned").insert(
            client_id.clone(),
            PreservedState {
                saved_at,
                attributes,
                rooms,
                queued_frames,
            },
        );
        debug!(client_id = %client_id, "client state preserved");

        let entries = self.entries.clone();
        let ttl = self.reconnection_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut map = entries.lock().expect("state store poisoned");
            // Only reap the generation this timer was armed for.
            if map.get(&client_id).is_some_and(|e| e.saved_at == saved_at) {
                map.remove(&client_id);
                debug!(client_id = %client_id, "preserved state expired");
            }
        });
    }

    /// Remove and return the record for `client_id`.
    ///
    /// A record older than the maximum reconnection time is deleted and
    /// `None` is returned, so a stale snapshot can never be restored
    /// later.
    pub fn take(&self, client_id: &str) -> Option<PreservedState> {
        let mut map = self.entries.lock().expect("state store poisoned");
        let entry = map.remove(client_id)?;
        if entry.saved_at.elapsed() > self.max_reconnection_time {
            debug!(client_id = %client_id, "preserved state too old, discarding");
            return None;
        }
        Some(entry)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.entries
            .lock()
            .expect("state store poisoned")
            .contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("state store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
