//! Join and leave sequences.
//!
//! ```text
//! join(r1, u1, handle)
//!   1  validate room/user
//!   2  ensure local room
//!   3  incr  room:r1:connectionId         ──► actor
//!   4  nonce = uuid v4
//!   5  registry.insert(entry)             (not ready: relay skips it)
//!   6  hset  room:r1:connections actor    ──► projection JSON
//!   7  get_scopes for joiner + local peers
//!   8  ROOM_STATE queued, entry ready     (one write lock)
//!   9  publish USER_JOINED
//! ```
//!
//! A failure in 3, 6 or 7 undoes 2, 5 and 6 before the error is returned.
//! Step 9 failing is only logged: the connection is joined and mirrored.
//!
//! Leave removes the entry, drops the projection and publishes USER_LEFT.
//! Leaving twice publishes once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::try_join_all;
use uuid::Uuid;

use crate::authz::AuthorizationResolver;
use crate::error::RoomError;
use crate::identity::AuthenticationError;
use crate::protocol::{ServerMessage, UpdatePresence, UserSummary};
use crate::registry::{
    ConnectionEntry, ConnectionHandle, ConnectionId, Projection, RoomRegistry, SharedRegistry,
};
use crate::relay::FanoutRelay;
use crate::store::{connection_id_key, connections_key, CoordinationStore};

/// A connection that completed the join sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedConnection {
    pub room_id: String,
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub nonce: String,
}

pub struct RoomService {
    registry: SharedRegistry,
    store: Arc<dyn CoordinationStore>,
    resolver: Arc<dyn AuthorizationResolver>,
    relay: Arc<FanoutRelay>,
}

impl RoomService {
    /// Build a service with its own registry and a relay on `channel`.
    ///
    /// The relay is not subscribed yet; call `relay().start()` once.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        resolver: Arc<dyn AuthorizationResolver>,
        channel: impl Into<String>,
    ) -> Self {
        let registry = RoomRegistry::shared();
        let relay = Arc::new(FanoutRelay::new(store.clone(), registry.clone(), channel));
        Self {
            registry,
            store,
            resolver,
            relay,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<FanoutRelay> {
        &self.relay
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Run the join sequence for one socket.
    ///
    /// On success the handle has ROOM_STATE queued as its first frame.
    pub async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        handle: ConnectionHandle,
    ) -> Result<JoinedConnection, RoomError> {
        if room_id.is_empty() {
            return Err(AuthenticationError::MissingRoom.into());
        }
        if user_id.is_empty() {
            return Err(AuthenticationError::MissingUid.into());
        }

        self.registry.write().await.ensure_room(room_id);

        let connection_id = match self.store.incr(&connection_id_key(room_id)).await {
            Ok(id) => id,
            Err(e) => {
                log::error!("Connection id allocation failed for room {room_id}: {e}");
                self.registry.write().await.remove_room_if_empty(room_id);
                return Err(e.into());
            }
        };

        let joined = JoinedConnection {
            room_id: room_id.to_string(),
            connection_id,
            user_id: user_id.to_string(),
            nonce: Uuid::new_v4().to_string(),
        };

        if let Err(e) = self.register(&joined, handle).await {
            log::warn!(
                "Join of {} to room {room_id} as actor {connection_id} failed: {e}",
                joined.user_id
            );
            self.rollback(&joined).await;
            return Err(e);
        }

        let notice = ServerMessage::UserJoined {
            actor: connection_id,
            user_id: joined.user_id.clone(),
        };
        if let Err(e) = self.relay.broadcast(room_id, &notice).await {
            log::error!("USER_JOINED for actor {connection_id} in room {room_id} not published: {e}");
        }

        log::info!(
            "User {} joined room {room_id} as actor {connection_id}",
            joined.user_id
        );
        Ok(joined)
    }

    /// Steps 5 through 8.
    ///
    /// ROOM_STATE lists the joiner and the ready local peers; peers still
    /// mid-join are left out and show up through their own USER_JOINED.
    async fn register(
        &self,
        joined: &JoinedConnection,
        handle: ConnectionHandle,
    ) -> Result<(), RoomError> {
        let entry = ConnectionEntry::new(
            joined.connection_id,
            joined.user_id.clone(),
            joined.nonce.clone(),
            joined.room_id.clone(),
            handle,
        );
        let projection = serde_json::to_string(&entry.projection())?;

        let members = {
            let mut registry = self.registry.write().await;
            registry.insert(entry);
            registry.members(&joined.room_id)
        };

        self.store
            .set_field(
                &connections_key(&joined.room_id),
                &joined.connection_id.to_string(),
                &projection,
            )
            .await?;

        let scopes = try_join_all(members.iter().map(|(_, user_id)| {
            self.resolver.get_scopes(&joined.room_id, user_id)
        }))
        .await?;
        let resolved: HashMap<ConnectionId, Vec<String>> = members
            .into_iter()
            .map(|(connection_id, _)| connection_id)
            .zip(scopes)
            .collect();

        let mut registry = self.registry.write().await;
        for (connection_id, scopes) in &resolved {
            if let Some(entry) = registry.entry_mut(&joined.room_id, *connection_id) {
                entry.scopes = scopes.clone();
            }
        }

        let room = registry
            .room(&joined.room_id)
            .ok_or_else(connection_gone)?;

        // Peers still mid-join announce themselves with USER_JOINED later.
        let users: BTreeMap<ConnectionId, UserSummary> = room
            .connections()
            .filter(|entry| entry.ready || entry.connection_id == joined.connection_id)
            .map(|entry| {
                (
                    entry.connection_id,
                    UserSummary {
                        id: entry.user_id.clone(),
                        scopes: entry.scopes.clone(),
                    },
                )
            })
            .collect();

        let scopes = resolved
            .get(&joined.connection_id)
            .cloned()
            .unwrap_or_default();
        let state = ServerMessage::RoomState {
            actor: joined.connection_id,
            nonce: joined.nonce.clone(),
            scopes,
            users,
        }
        .encode()?;

        let entry = registry
            .entry_mut(&joined.room_id, joined.connection_id)
            .ok_or_else(connection_gone)?;
        if !entry.handle.send_text(state) {
            log::debug!(
                "ROOM_STATE for actor {} not queued, socket already gone",
                joined.connection_id
            );
        }
        entry.ready = true;
        Ok(())
    }

    async fn rollback(&self, joined: &JoinedConnection) {
        {
            let mut registry = self.registry.write().await;
            registry.remove(&joined.room_id, joined.connection_id);
            registry.remove_room_if_empty(&joined.room_id);
        }

        if let Err(e) = self
            .store
            .delete_field(
                &connections_key(&joined.room_id),
                &joined.connection_id.to_string(),
            )
            .await
        {
            log::error!(
                "Rollback could not drop projection of actor {} in room {}: {e}",
                joined.connection_id,
                joined.room_id
            );
        }
    }

    /// Run the leave sequence.
    ///
    /// Returns `false` if the connection was already gone; nothing is
    /// published in that case.
    pub async fn leave(&self, room_id: &str, connection_id: ConnectionId) -> bool {
        let Some(removal) = self.registry.write().await.remove(room_id, connection_id) else {
            log::debug!("Leave for actor {connection_id} in room {room_id} ignored, not joined");
            return false;
        };

        if removal.room_removed {
            log::info!("Room {room_id} removed from this node (empty)");
        }

        if let Err(e) = self
            .store
            .delete_field(&connections_key(room_id), &connection_id.to_string())
            .await
        {
            log::error!("Projection of actor {connection_id} in room {room_id} not deleted: {e}");
        }

        let notice = ServerMessage::UserLeft {
            actor: connection_id,
        };
        if let Err(e) = self.relay.broadcast(room_id, &notice).await {
            log::error!("USER_LEFT for actor {connection_id} in room {room_id} not published: {e}");
        }

        log::info!(
            "User {} left room {room_id} (actor {connection_id})",
            removal.entry.user_id
        );
        true
    }

    /// Leave every connection hosted here. Returns how many left.
    pub async fn leave_all(&self) -> usize {
        let connections = self.registry.read().await.all_connections();
        let mut left = 0;
        for (room_id, connection_id) in connections {
            if self.leave(&room_id, connection_id).await {
                left += 1;
            }
        }
        left
    }

    /// Every projection mirrored for a room, across all nodes.
    pub async fn cluster_members(
        &self,
        room_id: &str,
    ) -> Result<BTreeMap<ConnectionId, Projection>, RoomError> {
        let fields = self.store.fields(&connections_key(room_id)).await?;
        let mut members = BTreeMap::new();
        for (field, value) in fields {
            let parsed = field
                .parse::<ConnectionId>()
                .ok()
                .zip(serde_json::from_str::<Projection>(&value).ok());
            match parsed {
                Some((connection_id, projection)) => {
                    members.insert(connection_id, projection);
                }
                None => log::warn!("Skipping malformed projection {field} in room {room_id}"),
            }
        }
        Ok(members)
    }

    /// Accepted and decoded. Nothing is relayed yet.
    pub async fn update_presence(
        &self,
        connection: &JoinedConnection,
        update: UpdatePresence,
    ) -> Result<(), RoomError> {
        log::debug!(
            "Presence update from actor {} in room {} (target {:?}, {} bytes)",
            connection.connection_id,
            connection.room_id,
            update.target_actor,
            update.data.to_string().len()
        );
        Ok(())
    }
}

/// The entry vanished mid-join, e.g. a shutdown drained the registry.
fn connection_gone() -> RoomError {
    RoomError::Transport(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
}
