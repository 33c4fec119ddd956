//! Client/server wire protocol.
//!
//! Text frames only. Two shapes share the socket:
//!
//! ```text
//! "ping"  ──►  "pong"                    liveness, plain text, never JSON
//!
//! {"type":100,"data":{...}}              one envelope
//! [{"type":100,...},{"type":100,...}]    batch, handled in array order
//! ```
//!
//! The liveness exchange is a deliberate exception to the envelope format:
//! it bypasses JSON entirely and never touches room state.
//!
//! Envelope `type` codes match the browser SDK the server talks to:
//!
//! | Code | Direction | Message |
//! |------|-----------|---------|
//! | 100  | client → server | `UPDATE_PRESENCE` |
//! | 101  | server → client | `USER_JOINED` |
//! | 102  | server → client | `USER_LEFT` |
//! | 104  | server → client | `ROOM_STATE` |

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::registry::ConnectionId;

/// Liveness ping sent by clients.
pub const LIVENESS_PING: &str = "ping";
/// Liveness reply.
pub const LIVENESS_PONG: &str = "pong";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame is neither an envelope nor an array of envelopes")]
    NotAnEnvelope,
    #[error("Envelope has no numeric type")]
    MissingType,
    #[error("Unknown message type {0}")]
    UnknownType(u64),
}

/// Message codes a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ClientMsgCode {
    UpdatePresence = 100,
}

impl ClientMsgCode {
    pub const ALL: &'static [ClientMsgCode] = &[ClientMsgCode::UpdatePresence];

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as u64 == code)
    }
}

/// Message codes the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServerMsgCode {
    UserJoined = 101,
    UserLeft = 102,
    RoomState = 104,
}

impl ServerMsgCode {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            101 => Some(Self::UserJoined),
            102 => Some(Self::UserLeft),
            104 => Some(Self::RoomState),
            _ => None,
        }
    }
}

impl Serialize for ServerMsgCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(*self as u16)
    }
}

/// One entry of `ROOM_STATE.users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub scopes: Vec<String>,
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// First message on every joined connection.
    RoomState {
        actor: ConnectionId,
        nonce: String,
        scopes: Vec<String>,
        users: BTreeMap<ConnectionId, UserSummary>,
    },
    UserJoined {
        actor: ConnectionId,
        user_id: String,
    },
    UserLeft {
        actor: ConnectionId,
    },
}

impl ServerMessage {
    pub fn code(&self) -> ServerMsgCode {
        match self {
            Self::RoomState { .. } => ServerMsgCode::RoomState,
            Self::UserJoined { .. } => ServerMsgCode::UserJoined,
            Self::UserLeft { .. } => ServerMsgCode::UserLeft,
        }
    }

    pub fn actor(&self) -> ConnectionId {
        match self {
            Self::RoomState { actor, .. }
            | Self::UserJoined { actor, .. }
            | Self::UserLeft { actor } => *actor,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame produced by [`encode`](Self::encode).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        #[derive(Deserialize)]
        struct RoomStateBody {
            actor: ConnectionId,
            nonce: String,
            scopes: Vec<String>,
            users: BTreeMap<ConnectionId, UserSummary>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct UserJoinedBody {
            actor: ConnectionId,
            user_id: String,
        }

        #[derive(Deserialize)]
        struct UserLeftBody {
            actor: ConnectionId,
        }

        let code = envelope_code(&value)?;
        match ServerMsgCode::from_code(code) {
            Some(ServerMsgCode::RoomState) => {
                let body: RoomStateBody = serde_json::from_value(value)?;
                Ok(Self::RoomState {
                    actor: body.actor,
                    nonce: body.nonce,
                    scopes: body.scopes,
                    users: body.users,
                })
            }
            Some(ServerMsgCode::UserJoined) => {
                let body: UserJoinedBody = serde_json::from_value(value)?;
                Ok(Self::UserJoined {
                    actor: body.actor,
                    user_id: body.user_id,
                })
            }
            Some(ServerMsgCode::UserLeft) => {
                let body: UserLeftBody = serde_json::from_value(value)?;
                Ok(Self::UserLeft { actor: body.actor })
            }
            None => Err(ProtocolError::UnknownType(code)),
        }
    }
}

impl Serialize for ServerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::RoomState {
                actor,
                nonce,
                scopes,
                users,
            } => {
                let mut map = serializer.serialize_map(Some(5))?;
                map.serialize_entry("type", &ServerMsgCode::RoomState)?;
                map.serialize_entry("actor", actor)?;
                map.serialize_entry("nonce", nonce)?;
                map.serialize_entry("scopes", scopes)?;
                map.serialize_entry("users", users)?;
                map.end()
            }
            Self::UserJoined { actor, user_id } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("type", &ServerMsgCode::UserJoined)?;
                map.serialize_entry("actor", actor)?;
                map.serialize_entry("userId", user_id)?;
                map.end()
            }
            Self::UserLeft { actor } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", &ServerMsgCode::UserLeft)?;
                map.serialize_entry("actor", actor)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for ServerMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(de::Error::custom)
    }
}

/// `UPDATE_PRESENCE` body.
///
/// Accepted and decoded; the server does not relay it yet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePresence {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub target_actor: Option<ConnectionId>,
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Liveness,
    /// Envelopes in the order they must be handled.
    Envelopes(Vec<Value>),
}

/// Split an inbound text frame into liveness or envelopes.
///
/// Envelope contents are not validated here; see [`envelope_code`].
pub fn parse_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    if text == LIVENESS_PING {
        return Ok(InboundFrame::Liveness);
    }

    match serde_json::from_str::<Value>(text)? {
        Value::Array(items) => Ok(InboundFrame::Envelopes(items)),
        envelope @ Value::Object(_) => Ok(InboundFrame::Envelopes(vec![envelope])),
        _ => Err(ProtocolError::NotAnEnvelope),
    }
}

/// Read the numeric `type` discriminant of an envelope.
pub fn envelope_code(envelope: &Value) -> Result<u64, ProtocolError> {
    match envelope {
        Value::Object(fields) => fields
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingType),
        _ => Err(ProtocolError::NotAnEnvelope),
    }
}
