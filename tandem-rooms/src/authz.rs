//! Authorization seam: permission scopes per (room, user).

use async_trait::async_trait;
use thiserror::Error;

/// Scopes granted when no resolver is configured.
pub const DEFAULT_SCOPES: &[&str] = &["room:write", "comments:write"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("Scope resolution failed for user {user_id} in room {room_id}: {reason}")]
    Unavailable {
        room_id: String,
        user_id: String,
        reason: String,
    },
}

/// Resolves the permission scopes a user holds inside a room.
///
/// Implementations may call out to a remote service. The result must be
/// stable for a given pair for the duration of one join.
#[async_trait]
pub trait AuthorizationResolver: Send + Sync {
    async fn get_scopes(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, AuthorizationError>;
}

/// Grants the same ordered scope list to everyone.
#[derive(Debug, Clone)]
pub struct StaticScopes {
    scopes: Vec<String>,
}

impl StaticScopes {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for StaticScopes {
    fn default() -> Self {
        Self::new(DEFAULT_SCOPES.iter().copied())
    }
}

#[async_trait]
impl AuthorizationResolver for StaticScopes {
    async fn get_scopes(
        &self,
        _room_id: &str,
        _user_id: &str,
    ) -> Result<Vec<String>, AuthorizationError> {
        Ok(self.scopes.clone())
    }
}
