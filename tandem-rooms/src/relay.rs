//! Cluster-wide fan-out over one shared channel.
//!
//! ```text
//!  broadcast(r1, msg)                                 every node
//!        │                                        ┌──────────────────┐
//!        ▼                                        │ FanoutRelay      │
//!  publish("rooms_channel", {roomId, message}) ──►│  lookup roomId   │──► local sockets
//!                                                 │  in own registry │
//!                                                 └──────────────────┘
//! ```
//!
//! One channel carries every room. Each node subscribes once and drops
//! envelopes for rooms it does not host. A node also receives its own
//! publishes; join/leave notices are safe to deliver that way.
//!
//! The channel keeps publish order, so one room's events reach every node
//! in the same order. Nothing is promised across rooms.
//!
//! When the store ends the subscription the relay subscribes again, backing
//! off from 100 ms up to 5 s. Payloads published in the gap are lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::RoomError;
use crate::protocol::ServerMessage;
use crate::registry::{Delivery, SharedRegistry};
use crate::store::{CoordinationStore, StoreError, Subscription};

/// Default name of the shared channel.
pub const DEFAULT_CHANNEL: &str = "rooms_channel";

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(5);

/// What travels on the shared channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub room_id: String,
    pub message: Value,
}

/// Statistics for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub messages_published: u64,
    pub messages_received: u64,
    pub messages_malformed: u64,
    pub frames_delivered: u64,
    pub frames_skipped: u64,
    pub resubscribes: u64,
}

#[derive(Default)]
struct AtomicRelayStats {
    messages_published: AtomicU64,
    messages_received: AtomicU64,
    messages_malformed: AtomicU64,
    frames_delivered: AtomicU64,
    frames_skipped: AtomicU64,
    resubscribes: AtomicU64,
}

pub struct FanoutRelay {
    store: Arc<dyn CoordinationStore>,
    registry: SharedRegistry,
    channel: String,
    stats: AtomicRelayStats,
}

impl FanoutRelay {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        registry: SharedRegistry,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            channel: channel.into(),
            stats: AtomicRelayStats::default(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish `message` for `room_id` to every node, this one included.
    ///
    /// Returns the number of subscribed nodes reached.
    pub async fn broadcast(
        &self,
        room_id: &str,
        message: &ServerMessage,
    ) -> Result<usize, RoomError> {
        let envelope = RelayEnvelope {
            room_id: room_id.to_string(),
            message: serde_json::to_value(message)?,
        };
        let payload = serde_json::to_string(&envelope)?;
        let reached = self.store.publish(&self.channel, &payload).await?;
        self.stats.messages_published.fetch_add(1, Ordering::Relaxed);
        Ok(reached)
    }

    /// Subscribe to the shared channel and deliver until the task is
    /// aborted.
    ///
    /// The subscription is live when this returns, so publishes made
    /// afterwards are guaranteed to come back to this node. Only this first
    /// subscribe can fail; later ones are retried.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, StoreError> {
        let subscription = self.store.subscribe(&self.channel).await?;
        log::info!("Fanout relay subscribed to {}", self.channel);

        let relay = self.clone();
        Ok(tokio::spawn(async move { relay.run(subscription).await }))
    }

    async fn run(&self, mut subscription: Subscription) {
        loop {
            while let Some(payload) = subscription.recv().await {
                self.deliver(&payload).await;
            }
            log::warn!(
                "Fanout relay channel {} closed, resubscribing",
                self.channel
            );
            subscription = self.resubscribe().await;
        }
    }

    async fn resubscribe(&self) -> Subscription {
        let mut delay = RESUBSCRIBE_MIN_DELAY;
        loop {
            tokio::time::sleep(delay).await;
            match self.store.subscribe(&self.channel).await {
                Ok(subscription) => {
                    self.stats.resubscribes.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "Fanout relay resubscribed to {}; events published meanwhile were missed",
                        self.channel
                    );
                    return subscription;
                }
                Err(e) => {
                    delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
                    log::error!(
                        "Resubscribing to {} failed, next attempt in {delay:?}: {e}",
                        self.channel
                    );
                }
            }
        }
    }

    /// Hand one channel payload to local connections of its room.
    pub async fn deliver(&self, payload: &str) -> Delivery {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let envelope = match serde_json::from_str::<RelayEnvelope>(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.messages_malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping malformed relay payload: {e}");
                return Delivery::default();
            }
        };

        let text = envelope.message.to_string();
        let delivery = self.registry.read().await.deliver(&envelope.room_id, &text);

        self.stats
            .frames_delivered
            .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.stats
            .frames_skipped
            .fetch_add(delivery.skipped as u64, Ordering::Relaxed);
        log::trace!(
            "Relayed to room {}: {} delivered, {} skipped",
            envelope.room_id,
            delivery.delivered,
            delivery.skipped
        );
        delivery
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            messages_published: self.stats.messages_published.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            messages_malformed: self.stats.messages_malformed.load(Ordering::Relaxed),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            frames_skipped: self.stats.frames_skipped.load(Ordering::Relaxed),
            resubscribes: self.stats.resubscribes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionEntry, ConnectionHandle, RoomRegistry};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{broadcast, mpsc};
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::tungstenite::Message;

    async fn add_connection(
        registry: &SharedRegistry,
        room_id: &str,
        connection_id: i64,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (handle, rx) = ConnectionHandle::channel();
        let mut entry = ConnectionEntry::new(connection_id, "u", "n", room_id, handle);
        entry.ready = true;
        registry.write().await.insert(entry);
        rx
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> ServerMessage {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Message::Text(text))) => ServerMessage::decode(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_local_room_through_channel() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::default());
        let registry = RoomRegistry::shared();
        let relay = Arc::new(FanoutRelay::new(store, registry.clone(), DEFAULT_CHANNEL));
        let _task = relay.start().await.unwrap();

        let mut rx = add_connection(&registry, "r1", 1).await;
        let reached = relay
            .broadcast("r1", &ServerMessage::UserLeft { actor: 9 })
            .await
            .unwrap();
        assert_eq!(reached, 1);

        assert_eq!(next_message(&mut rx).await, ServerMessage::UserLeft { actor: 9 });
        assert_eq!(relay.stats().messages_published, 1);
    }

    #[tokio::test]
    async fn test_two_relays_share_one_channel() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::default());
        let registry_a = RoomRegistry::shared();
        let registry_b = RoomRegistry::shared();
        let relay_a = Arc::new(FanoutRelay::new(store.clone(), registry_a.clone(), "c"));
        let relay_b = Arc::new(FanoutRelay::new(store, registry_b.clone(), "c"));
        let _a = relay_a.start().await.unwrap();
        let _b = relay_b.start().await.unwrap();

        let mut rx_a = add_connection(&registry_a, "r1", 1).await;
        let mut rx_b = add_connection(&registry_b, "r1", 2).await;
        let mut rx_other = add_connection(&registry_b, "r2", 1).await;

        for actor in 1..=3 {
            relay_a
                .broadcast("r1", &ServerMessage::UserLeft { actor })
                .await
                .unwrap();
        }

        for actor in 1..=3 {
            let expected = ServerMessage::UserLeft { actor };
            assert_eq!(next_message(&mut rx_a).await, expected);
            assert_eq!(next_message(&mut rx_b).await, expected);
        }
        assert!(timeout(Duration::from_millis(50), rx_other.recv()).await.is_err());
    }

    /// Hands out one already-closed subscription, then fails a subscribe,
    /// then behaves.
    #[derive(Default)]
    struct DroppingStore {
        inner: MemoryStore,
        subscribes: AtomicUsize,
    }

    #[async_trait]
    impl CoordinationStore for DroppingStore {
        async fn incr(&self, key: &str) -> Result<i64, StoreError> {
            self.inner.incr(key).await
        }

        async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set_field(key, field, value).await
        }

        async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
            self.inner.delete_field(key, field).await
        }

        async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
            self.inner.fields(key).await
        }

        async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
            match self.subscribes.fetch_add(1, Ordering::SeqCst) {
                0 => {
                    let (_closed, receiver) = broadcast::channel(1);
                    Ok(Subscription::new(channel, receiver))
                }
                1 => Err(StoreError::Closed),
                _ => self.inner.subscribe(channel).await,
            }
        }
    }

    #[tokio::test]
    async fn test_relay_resubscribes_after_store_drops_subscription() {
        let store = Arc::new(DroppingStore::default());
        let registry = RoomRegistry::shared();
        let relay = Arc::new(FanoutRelay::new(store.clone(), registry.clone(), "c"));
        let task = relay.start().await.unwrap();

        // 100 ms, failed attempt, then 200 ms
        timeout(Duration::from_secs(2), async {
            while relay.stats().resubscribes == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("relay never resubscribed");
        assert!(!task.is_finished());
        assert_eq!(store.subscribes.load(Ordering::SeqCst), 3);

        let mut rx = add_connection(&registry, "r1", 1).await;
        let reached = relay
            .broadcast("r1", &ServerMessage::UserLeft { actor: 4 })
            .await
            .unwrap();
        assert_eq!(reached, 1);
        assert_eq!(next_message(&mut rx).await, ServerMessage::UserLeft { actor: 4 });
        task.abort();
    }

    #[tokio::test]
    async fn test_deliver_ignores_unknown_room_and_garbage() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::default());
        let registry = RoomRegistry::shared();
        let relay = FanoutRelay::new(store, registry.clone(), "c");
        let mut rx = add_connection(&registry, "r1", 1).await;

        let delivery = relay
            .deliver(r#"{"roomId":"elsewhere","message":{"type":102,"actor":1}}"#)
            .await;
        assert_eq!(delivery, Delivery::default());

        let delivery = relay.deliver("not json").await;
        assert_eq!(delivery, Delivery::default());
        assert_eq!(relay.stats().messages_malformed, 1);
        assert!(rx.try_recv().is_err());

        let delivery = relay
            .deliver(r#"{"roomId":"r1","message":{"type":102,"actor":1}}"#)
            .await;
        assert_eq!(delivery.delivered, 1);
        assert_eq!(relay.stats().messages_received, 3);
    }
}
