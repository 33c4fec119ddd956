//! # tandem-rooms: Distributed real-time room service
//!
//! Clients join rooms over WebSocket and are told who else is there as
//! people arrive and leave, even when they are connected to different
//! nodes.
//!
//! ## Architecture
//!
//! ```text
//!  clients ──► RoomServer (node A)           RoomServer (node B) ◄── clients
//!                 │                                 │
//!                 ▼                                 ▼
//!            RoomService ── RoomRegistry       RoomService ── RoomRegistry
//!                 │        (local sockets)          │        (local sockets)
//!                 ▼                                 ▼
//!            FanoutRelay ◄──────┐         ┌──► FanoutRelay
//!                               │         │
//!                        ┌──────┴─────────┴──────┐
//!                        │  CoordinationStore    │
//!                        │  incr · hash · pubsub │
//!                        └───────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`identity`]: token → user id
//! - [`authz`]: user id → scopes in a room
//! - [`store`]: shared counters, projections and the fan-out channel
//! - [`protocol`]: JSON envelopes, message codes, `ping`/`pong`
//! - [`registry`]: per-node rooms and their live sockets
//! - [`relay`]: one channel carrying every room's events
//! - [`rooms`]: join and leave sequences
//! - [`handlers`]: message code → handler table
//! - [`server`]: WebSocket gateway

pub mod authz;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use authz::{AuthorizationError, AuthorizationResolver, StaticScopes, DEFAULT_SCOPES};
pub use error::RoomError;
pub use identity::{AuthenticationError, Identity, IdentityVerifier, JwtClaimsDecoder};
pub use protocol::{ClientMsgCode, ProtocolError, ServerMessage, ServerMsgCode, UserSummary};
pub use registry::{ConnectionHandle, ConnectionId, Projection, RoomRegistry};
pub use relay::{FanoutRelay, RelayEnvelope, RelayStats, DEFAULT_CHANNEL};
pub use rooms::{JoinedConnection, RoomService};
pub use server::{ConnectParams, RoomServer, ServerConfig, ServerStats};
pub use store::{
    CoordinationStore, MemoryStore, RedisStore, RemoteStore, StoreError, StoreServer,
};
