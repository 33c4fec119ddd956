//! WebSocket gateway: one node of the cluster.
//!
//! Architecture:
//! ```text
//! ws://host/v7?roomId=r1&tok=…
//!        │
//!        ▼  handshake (path check → 404)
//!   IdentityVerifier ── uid
//!        │
//!        ▼
//!   RoomService::join ──► ROOM_STATE ──► writer task ──► socket
//!        │
//!        ▼  read loop, one frame at a time
//!   "ping" → "pong"   envelopes → handlers::dispatch
//!        │
//!        ▼  close / error / idle timeout
//!   RoomService::leave
//! ```
//!
//! Every socket gets an outbound queue drained by its own writer task. The
//! registry holds the sending side, so relayed events and direct replies
//! share one ordered queue.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::authz::{AuthorizationResolver, StaticScopes};
use crate::error::RoomError;
use crate::handlers::{self, Dispatch, HandlerContext};
use crate::identity::{AuthenticationError, IdentityVerifier, JwtClaimsDecoder};
use crate::protocol::{parse_frame, InboundFrame, LIVENESS_PONG};
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::relay::DEFAULT_CHANNEL;
use crate::rooms::{JoinedConnection, RoomService};
use crate::store::{CoordinationStore, MemoryStore};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Only WebSocket upgrades on this path are accepted
    pub path: String,
    /// Shared fan-out channel name
    pub channel: String,
    /// Close sockets silent for this long (None = never)
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5100".to_string(),
            path: "/v7".to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            idle_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `TANDEM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(bind_addr) = lookup("TANDEM_BIND_ADDR") {
            config.bind_addr = bind_addr;
        }
        if let Some(path) = lookup("TANDEM_PATH") {
            config.path = path;
        }
        if let Some(channel) = lookup("TANDEM_CHANNEL") {
            config.channel = channel;
        }
        if let Some(raw) = lookup("TANDEM_IDLE_TIMEOUT_SECS") {
            match raw.parse::<u64>() {
                Ok(0) => config.idle_timeout_secs = None,
                Ok(secs) => config.idle_timeout_secs = Some(secs),
                Err(e) => log::warn!("Ignoring TANDEM_IDLE_TIMEOUT_SECS={raw}: {e}"),
            }
        }
        config
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

/// `roomId` and `tok` from the upgrade request's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub room_id: String,
    pub token: String,
}

impl ConnectParams {
    pub fn from_query(query: Option<&str>) -> Result<Self, AuthenticationError> {
        let mut room_id = None;
        let mut token = None;
        for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "roomId" => room_id = Some(value.into_owned()),
                "tok" => token = Some(value.into_owned()),
                _ => {}
            }
        }

        let room_id = room_id
            .filter(|r| !r.is_empty())
            .ok_or(AuthenticationError::MissingRoom)?;
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(AuthenticationError::MissingToken)?;
        Ok(Self { room_id, token })
    }
}

/// One gateway node.
#[derive(Clone)]
pub struct RoomServer {
    config: Arc<ServerConfig>,
    rooms: Arc<RoomService>,
    identity: Arc<dyn IdentityVerifier>,
    stats: Arc<AtomicServerStats>,
    relay_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RoomServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn CoordinationStore>,
        identity: Arc<dyn IdentityVerifier>,
        resolver: Arc<dyn AuthorizationResolver>,
    ) -> Self {
        let rooms = Arc::new(RoomService::new(store, resolver, config.channel.clone()));
        Self {
            config: Arc::new(config),
            rooms,
            identity,
            stats: Arc::new(AtomicServerStats::default()),
            relay_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Unsigned-JWT identity and default scopes over `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn CoordinationStore>) -> Self {
        Self::new(
            config,
            store,
            Arc::new(JwtClaimsDecoder),
            Arc::new(StaticScopes::default()),
        )
    }

    /// Single node with an in-process store.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::default()))
    }

    /// Subscribe to the shared channel. Later calls do nothing.
    pub async fn start(&self) -> Result<(), RoomError> {
        let mut relay_task = self.relay_task.lock().await;
        if relay_task.is_none() {
            *relay_task = Some(self.rooms.relay().start().await?);
        }
        Ok(())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RoomError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve WebSocket connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RoomError> {
        self.start().await?;
        log::info!(
            "Room server listening on {} (path {})",
            listener.local_addr()?,
            self.config.path
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Leave every local connection, close its socket and stop the relay.
    pub async fn shutdown(&self) -> usize {
        let handles = self.rooms.registry().read().await.handles();
        let left = self.rooms.leave_all().await;
        for handle in handles {
            handle.send(Message::Close(None));
        }
        if let Some(task) = self.relay_task.lock().await.take() {
            task.abort();
        }
        log::info!("Room server shut down, {left} connections left their rooms");
        left
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) -> Result<(), RoomError> {
        let mut query = None;
        let path = self.config.path.as_str();
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if request.uri().path() != path {
                    let mut rejection = ErrorResponse::new(None);
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    return Err(rejection);
                }
                query = request.uri().query().map(str::to_owned);
                Ok(response)
            },
        )
        .await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let identity = match ConnectParams::from_query(query.as_deref()) {
            Ok(params) => self
                .identity
                .decode(&params.token)
                .await
                .map(|identity| (params.room_id, identity)),
            Err(e) => Err(e),
        };
        let (room_id, identity) = match identity {
            Ok(found) => found,
            Err(e) => {
                log::info!("Refusing connection from {addr}: {e}");
                self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
        };

        let (handle, mut outbound) = ConnectionHandle::channel();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Err(e) = ws_sender.send(message).await {
                    log::debug!("Writer for {addr} stopped: {e}");
                    return;
                }
            }
            if let Err(e) = ws_sender.close().await {
                log::debug!("Closing socket of {addr} failed: {e}");
            }
        });

        let joined = match self.rooms.join(&room_id, &identity.uid, handle.clone()).await {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Join of {addr} to room {room_id} failed: {e}");
                handle.send(Message::Close(None));
                drop(handle);
                if let Err(e) = writer.await {
                    log::debug!("Writer task for {addr} ended abnormally: {e}");
                }
                self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        let outcome = self.read_loop(&mut ws_receiver, &joined, &handle).await;

        self.rooms.leave(&joined.room_id, joined.connection_id).await;
        drop(handle);
        if let Err(e) = writer.await {
            log::debug!("Writer task for {addr} ended abnormally: {e}");
        }
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::debug!("Connection from {addr} finished");
        outcome
    }

    async fn read_loop<S>(
        &self,
        ws_receiver: &mut S,
        joined: &JoinedConnection,
        handle: &ConnectionHandle,
    ) -> Result<(), RoomError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let idle_timeout = self.config.idle_timeout();
        loop {
            let next = match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, ws_receiver.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        log::info!(
                            "Actor {} in room {} idle for {limit:?}, closing",
                            joined.connection_id,
                            joined.room_id
                        );
                        return Ok(());
                    }
                },
                None => ws_receiver.next().await,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    self.handle_text(joined, handle, text.as_str()).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    handle.send(Message::Pong(data));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Ignoring {} byte binary frame from actor {}",
                        data.len(),
                        joined.connection_id
                    );
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn handle_text(&self, joined: &JoinedConnection, handle: &ConnectionHandle, text: &str) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let envelopes = match parse_frame(text) {
            Ok(InboundFrame::Liveness) => {
                handle.send_text(LIVENESS_PONG);
                return;
            }
            Ok(InboundFrame::Envelopes(envelopes)) => envelopes,
            Err(e) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping frame from actor {}: {e}", joined.connection_id);
                return;
            }
        };

        let ctx = HandlerContext {
            rooms: &self.rooms,
            connection: joined,
        };
        for envelope in envelopes {
            match handlers::dispatch(&ctx, envelope).await {
                Ok(Dispatch::Handled(code)) => {
                    log::trace!("Actor {} handled {code:?}", joined.connection_id);
                }
                Ok(Dispatch::Ignored) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Envelope from actor {} failed: {e}", joined.connection_id);
                }
            }
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomService> {
        &self.rooms
    }

    pub async fn has_room(&self, room_id: &str) -> bool {
        self.rooms.registry().read().await.room(room_id).is_some()
    }

    pub async fn local_connection_count(&self, room_id: &str) -> usize {
        self.rooms.registry().read().await.local_connection_count(room_id)
    }

    /// Connection ids hosted on this node for `room_id`, ascending.
    pub async fn local_connection_ids(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .registry()
            .read()
            .await
            .members(room_id)
            .into_iter()
            .map(|(connection_id, _)| connection_id)
            .collect()
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_rooms: self.rooms.registry().read().await.room_count(),
        }
    }
}
