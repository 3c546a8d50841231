//! Rooms: named sets of connections addressable as a group.
//!
//! The manager owns the rooms; rooms hold non-owning handles to
//! connections.  Member operations take the per-room lock, map
//! mutation takes the manager lock, and neither is held across
//! socket I/O — a room broadcast only try-enqueues.

use crate::connection::Connection;
use crate::error::HubError;
use crate::metrics::HubMetrics;
use crate::send_queue::EnqueueError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

pub struct Room {
    name: String,
    /// 0 means unlimited.
    capacity: usize,
    created_at: DateTime<Utc>,
    members: RwLock<HashMap<String, Arc<Connection>>>,
    metadata: RwLock<HashMap<String, Value>>,
}

impl Room {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Room {
            name: name.into(),
            capacity,
            created_at: Utc::now(),
            members: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Add a member.  Idempotent for an existing member; fails with
    /// `RoomFull` once the capacity is reached.
    pub async fn add(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        let mut members = self.members.write().await;
        if members.contains_key(conn.id()) {
            return Ok(());
        }
        if self.capacity > 0 && members.len() >= self.capacity {
            return Err(HubError::RoomFull(self.name.clone()));
        }
        members.insert(conn.id().to_owned(), conn);
        Ok(())
    }

    /// Remove a member.  Idempotent; returns whether it was present.
    pub async fn remove(&self, connection_id: &str) -> bool {
        self.members.write().await.remove(connection_id).is_some()
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.members.read().await.contains_key(connection_id)
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Stable snapshot of the current members.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.members.read().await.values().cloned().collect()
    }

    /// Try-enqueue `frame` on every member except `exclude`.
    ///
    /// A member with a full queue is skipped, not closed: the queue
    /// overflow policy is per-connection, not per-room.
    pub async fn broadcast(&self, frame: &[u8], exclude: Option<&str>) {
        let members = self.connections().await;
        for conn in members {
            if exclude.is_some_and(|id| id == conn.id()) {
                continue;
            }
            match conn.enqueue_frame(frame.to_vec()) {
                Ok(()) => {}
                Err(EnqueueError::Full) => {
                    conn.metrics.message_dropped();
                    debug!(
                        room = %self.name,
                        connection_id = %conn.id(),
                        "send queue full during room broadcast, skipping member"
                    );
                }
                Err(EnqueueError::Closed) => {}
            }
        }
    }

    pub async fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().await.get(key).cloned()
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.write().await.insert(key.into(), value);
    }
}

// ---------------------------------------------------------------------------
// RoomManager
// ---------------------------------------------------------------------------

/// Registry of rooms, created lazily on first use.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Capacity applied to rooms created on demand.
    default_capacity: usize,
    metrics: Arc<HubMetrics>,
}

impl RoomManager {
    pub fn new(default_capacity: usize, metrics: Arc<HubMetrics>) -> Self {
        RoomManager {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            metrics,
        }
    }

    /// Create a room with an explicit capacity, or return the existing
    /// one under that name.
    pub async fn create_room(&self, name: &str, capacity: usize) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Arc::new(Room::new(name, capacity));
        rooms.insert(name.to_owned(), room.clone());
        self.metrics.room_created();
        debug!(room = %name, capacity, "room created");
        room
    }

    pub async fn get_room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Get the room, creating it with the default capacity if absent.
    pub async fn get_or_create(&self, name: &str) -> Arc<Room> {
        self.create_room(name, self.default_capacity).await
    }

    /// Remove the room from the registry.  Existing handles stay valid
    /// until dropped; returns whether the room existed.
    pub async fn delete_room(&self, name: &str) -> bool {
        let removed = self.rooms.write().await.remove(name).is_some();
        if removed {
            self.metrics.room_deleted();
            debug!(room = %name, "room deleted");
        }
        removed
    }

    pub async fn list(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn clear(&self) {
        let mut rooms = self.rooms.write().await;
        for _ in 0..rooms.len() {
            self.metrics.room_deleted();
        }
        rooms.clear();
    }

    /// Add a connection to a room (created on demand), keeping the
    /// connection's own membership set in sync.
    pub async fn add_to_room(&self, name: &str, conn: Arc<Connection>) -> Result<(), HubError> {
        let room = self.get_or_create(name).await;
        room.add(conn.clone()).await?;
        conn.note_joined(name);
        Ok(())
    }

    /// Remove a connection from a room, keeping the connection's own
    /// membership set in sync.  No-op for unknown rooms or non-members.
    pub async fn remove_from_room(&self, name: &str, conn: &Connection) {
        if let Some(room) = self.get_room(name).await {
            room.remove(conn.id()).await;
        }
        conn.note_left(name);
    }
}
