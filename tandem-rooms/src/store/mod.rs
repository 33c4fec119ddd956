//! Coordination store: the only state shared between nodes.
//!
//! ```text
//!  node A ──┐                       ┌── incr   room:{id}:connectionId
//!           ├── CoordinationStore ──┼── hset   room:{id}:connections
//!  node B ──┘                       └── pub/sub rooms_channel
//! ```
//!
//! Room logic only sees the [`CoordinationStore`] trait. Backends:
//!
//! - [`memory::MemoryStore`]: in-process; several nodes in one process
//!   share a single instance
//! - [`remote::RemoteStore`]: talks to a [`remote::StoreServer`] over TCP so
//!   nodes in separate processes share one counter, mirror and channel
//! - [`self::redis::RedisStore`]: a Redis server, for production clusters

pub mod memory;
pub mod redis;
pub mod remote;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;
pub use remote::{RemoteStore, StoreServer};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed store message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Store connection closed")]
    Closed,
    #[error("Store rejected request: {0}")]
    Remote(String),
    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
    #[error("Counter overflow for key {0}")]
    Overflow(String),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Key holding the per-room connection-id counter.
pub fn connection_id_key(room_id: &str) -> String {
    format!("room:{room_id}:connectionId")
}

/// Key holding the per-room projection mirror (field = connection id).
pub fn connections_key(room_id: &str) -> String {
    format!("room:{room_id}:connections")
}

/// Narrow interface to the shared store.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically increment `key` and return the new value (first call → 1).
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Returns whether the field existed.
    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Returns the number of subscribers the payload reached.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Ordered stream of payloads published on one channel.
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: broadcast::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            receiver,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the channel is gone.
    ///
    /// A subscriber that falls behind the buffer skips the overwritten
    /// payloads and keeps going.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Subscription to {} lagged, {skipped} messages skipped",
                        self.channel
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(connection_id_key("r1"), "room:r1:connectionId");
        assert_eq!(connections_key("r1"), "room:r1:connections");
    }

    #[tokio::test]
    async fn test_subscription_skips_lagged_payloads() {
        let (tx, rx) = broadcast::channel(2);
        let mut subscription = Subscription::new("c", rx);
        for i in 0..5 {
            tx.send(format!("m{i}")).unwrap();
        }
        assert_eq!(subscription.recv().await.as_deref(), Some("m3"));
        assert_eq!(subscription.recv().await.as_deref(), Some("m4"));

        drop(tx);
        assert_eq!(subscription.recv().await, None);
    }
}
