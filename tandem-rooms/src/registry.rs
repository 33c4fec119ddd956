//! Per-node room registry.
//!
//! ```text
//! RoomRegistry (this node only)
//!   └── "r1" ── Room
//!                ├── 1 → ConnectionEntry { user_id, nonce, handle, scopes }
//!                └── 3 → ConnectionEntry { ... }
//! ```
//!
//! The registry is authoritative for local delivery. It never leaves the
//! node: only [`Projection`]s are mirrored into the coordination store, and
//! the live [`ConnectionHandle`] is never serialized.
//!
//! A room exists here from its first local join until its last local leave.
//! Other nodes may still host the same room id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

/// Cluster-unique (per room), monotonically increasing connection id.
pub type ConnectionId = i64;

/// Registry shared by the tasks of one node.
pub type SharedRegistry = Arc<RwLock<RoomRegistry>>;

/// Outbound queue feeding one socket's writer task.
///
/// Unbounded: a frame queued while the socket is open is never dropped.
/// The queue only ends when the writer task goes away.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Whether the writer side is still draining this queue.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame without waiting. Returns `false` only if the socket is
    /// gone.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        let text: String = text.into();
        self.send(Message::Text(text.into()))
    }
}

/// Serializable subset of a connection, mirrored cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub user_id: String,
    pub nonce: String,
    pub room_id: String,
}

#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub nonce: String,
    pub room_id: String,
    pub handle: ConnectionHandle,
    /// Last scopes resolved for this user in this room.
    pub scopes: Vec<String>,
    /// Set once ROOM_STATE is queued; relayed events skip the entry until then.
    pub ready: bool,
}

impl ConnectionEntry {
    pub fn new(
        connection_id: ConnectionId,
        user_id: impl Into<String>,
        nonce: impl Into<String>,
        room_id: impl Into<String>,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            connection_id,
            user_id: user_id.into(),
            nonce: nonce.into(),
            room_id: room_id.into(),
            handle,
            scopes: Vec::new(),
            ready: false,
        }
    }

    pub fn projection(&self) -> Projection {
        Projection {
            user_id: self.user_id.clone(),
            nonce: self.nonce.clone(),
            room_id: self.room_id.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Room {
    id: String,
    connections: BTreeMap<ConnectionId, ConnectionEntry>,
}

impl Room {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connections: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&ConnectionEntry> {
        self.connections.get(&connection_id)
    }

    /// Entries ordered by connection id.
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.connections.values()
    }
}

/// Result of removing a connection.
#[derive(Debug)]
pub struct Removal {
    pub entry: ConnectionEntry,
    /// The room had no other local connection and was dropped.
    pub room_removed: bool,
}

/// Outcome of delivering one frame to a local room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Create the room if this node has no entry for it yet.
    ///
    /// Returns `true` if it was created.
    pub fn ensure_room(&mut self, room_id: &str) -> bool {
        if self.rooms.contains_key(room_id) {
            return false;
        }
        self.rooms.insert(room_id.to_string(), Room::new(room_id));
        log::debug!("Room {room_id} created on this node");
        true
    }

    pub fn insert(&mut self, entry: ConnectionEntry) {
        let room = self
            .rooms
            .entry(entry.room_id.clone())
            .or_insert_with(|| Room::new(entry.room_id.clone()));
        room.connections.insert(entry.connection_id, entry);
    }

    /// Remove a connection, dropping its room if that leaves it empty.
    ///
    /// Returns `None` if the connection is not registered here.
    pub fn remove(&mut self, room_id: &str, connection_id: ConnectionId) -> Option<Removal> {
        let room = self.rooms.get_mut(room_id)?;
        let entry = room.connections.remove(&connection_id)?;
        let room_removed = room.is_empty();
        if room_removed {
            self.rooms.remove(room_id);
        }
        Some(Removal {
            entry,
            room_removed,
        })
    }

    /// Returns `true` if the room existed and was empty.
    pub fn remove_room_if_empty(&mut self, room_id: &str) -> bool {
        match self.rooms.get(room_id) {
            Some(room) if room.is_empty() => {
                self.rooms.remove(room_id);
                true
            }
            _ => false,
        }
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn contains(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.connections.contains_key(&connection_id))
    }

    pub fn entry_mut(
        &mut self,
        room_id: &str,
        connection_id: ConnectionId,
    ) -> Option<&mut ConnectionEntry> {
        self.rooms.get_mut(room_id)?.connections.get_mut(&connection_id)
    }

    /// `(connection_id, user_id)` of every local connection in a room.
    pub fn members(&self, room_id: &str) -> Vec<(ConnectionId, String)> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.connections()
                    .map(|entry| (entry.connection_id, entry.user_id.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn local_connection_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, Room::len)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// Every local `(room_id, connection_id)` pair.
    pub fn all_connections(&self) -> Vec<(String, ConnectionId)> {
        self.rooms
            .values()
            .flat_map(|room| {
                room.connections()
                    .map(move |entry| (room.id.clone(), entry.connection_id))
            })
            .collect()
    }

    /// Transport handles of every local connection.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.rooms
            .values()
            .flat_map(Room::connections)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Queue `text` to every ready, open connection of a local room.
    ///
    /// Closed sockets and connections still joining are skipped.
    pub fn deliver(&self, room_id: &str, text: &str) -> Delivery {
        let mut delivery = Delivery::default();
        let Some(room) = self.rooms.get(room_id) else {
            return delivery;
        };

        for entry in room.connections() {
            if entry.ready && entry.handle.is_open() && entry.handle.send_text(text) {
                delivery.delivered += 1;
            } else {
                delivery.skipped += 1;
            }
        }
        delivery
    }
}
