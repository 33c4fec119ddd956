//! Crate-level error type.

use thiserror::Error;

use crate::authz::AuthorizationError;
use crate::identity::AuthenticationError;
use crate::protocol::ProtocolError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),
    #[error("Authorization failed: {0}")]
    Authorization(#[from] AuthorizationError),
    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RoomError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::Json(e))
    }
}
