//! In-process coordination store.
//!
//! Every operation runs under one mutex, so counters are linearizable and
//! publishes enter each channel in a single global order. Pub/sub rides on
//! tokio broadcast channels; a subscriber that lags beyond `capacity` loses
//! the oldest payloads.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use super::{CoordinationStore, StoreError, Subscription};

#[derive(Default)]
struct MemoryState {
    counters: HashMap<String, i64>,
    hashes: HashMap<String, HashMap<String, String>>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    capacity: usize,
}

impl MemoryStore {
    /// `capacity` bounds how many payloads a subscriber may fall behind.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Current value of a counter without incrementing it.
    pub async fn counter(&self, key: &str) -> Option<i64> {
        self.state.lock().await.counters.get(key).copied()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter = counter
            .checked_add(1)
            .ok_or_else(|| StoreError::Overflow(key.to_string()))?;
        Ok(*counter)
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        let existed = hash.remove(field).is_some();
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(existed)
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        let Some(sender) = state.channels.get(channel) else {
            return Ok(0);
        };
        // Err only means nobody is listening.
        Ok(sender.send(payload.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut state = self.state.lock().await;
        let capacity = self.capacity;
        let sender = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
        Ok(Subscription::new(channel, sender.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_incr_starts_at_one_per_key() {
        let store = MemoryStore::default();
        assert_eq!(store.incr("a").await.unwrap(), 1);
        assert_eq!(store.incr("a").await.unwrap(), 2);
        assert_eq!(store.incr("b").await.unwrap(), 1);
        assert_eq!(store.counter("a").await, Some(2));
        assert_eq!(store.counter("missing").await, None);
    }

    #[tokio::test]
    async fn test_concurrent_incr_is_unique() {
        let store = Arc::new(MemoryStore::default());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..50 {
                    ids.push(store.incr("room:r1:connectionId").await.unwrap());
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            let ids = task.await.unwrap();
            // Each task observes its own ids in increasing order
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            for id in ids {
                assert!(seen.insert(id), "id {id} issued twice");
            }
        }
        assert_eq!(seen.len(), 800);
        assert_eq!(*seen.iter().max().unwrap(), 800);
    }

    #[tokio::test]
    async fn test_fields_mirror() {
        let store = MemoryStore::default();
        store.set_field("h", "1", "one").await.unwrap();
        store.set_field("h", "2", "two").await.unwrap();
        store.set_field("h", "2", "deux").await.unwrap();

        let fields = store.fields("h").await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["2"], "deux");

        assert!(store.delete_field("h", "1").await.unwrap());
        assert!(!store.delete_field("h", "1").await.unwrap());
        assert!(store.delete_field("h", "2").await.unwrap());
        assert!(store.fields("h").await.unwrap().is_empty());
        assert!(!store.delete_field("never", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let store = MemoryStore::default();
        assert_eq!(store.publish("rooms_channel", "hello").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_order_preserved_for_every_subscriber() {
        let store = MemoryStore::default();
        let mut first = store.subscribe("c").await.unwrap();
        let mut second = store.subscribe("c").await.unwrap();
        let mut other = store.subscribe("other").await.unwrap();

        for i in 0..10 {
            assert_eq!(store.publish("c", &format!("m{i}")).await.unwrap(), 2);
        }

        for i in 0..10 {
            assert_eq!(first.recv().await.unwrap(), format!("m{i}"));
            assert_eq!(second.recv().await.unwrap(), format!("m{i}"));
        }

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), other.recv()).await;
        assert!(nothing.is_err(), "other channel must stay silent");
    }
}
