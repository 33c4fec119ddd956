//! Redis-backed coordination store.
//!
//! ```text
//! incr          INCR    room:{id}:connectionId
//! set_field     HSET    room:{id}:connections <actor> <projection>
//! delete_field  HDEL    room:{id}:connections <actor>
//! fields        HGETALL room:{id}:connections
//! publish       PUBLISH <channel> <payload>
//! subscribe     SUBSCRIBE <channel>              (own connection)
//! ```
//!
//! Commands share one multiplexed connection. A connection in subscribe
//! mode cannot run commands, so every subscription opens its own pub/sub
//! connection and a task forwarding its messages.

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::Client;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast;

use super::{CoordinationStore, StoreError, Subscription};

pub struct RedisStore {
    client: Client,
    connection: MultiplexedConnection,
    capacity: usize,
}

impl RedisStore {
    /// Open the command connection eagerly so a bad URL or an unreachable
    /// server fails at startup.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        log::debug!("Connected to Redis");
        Ok(Self {
            client,
            connection,
            capacity: 1024,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut connection = self.connection.clone();
        let value = ::redis::cmd("INCR")
            .arg(key)
            .query_async::<i64>(&mut connection)
            .await?;
        Ok(value)
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        ::redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let removed = ::redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async::<i64>(&mut connection)
            .await?;
        Ok(removed > 0)
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut connection = self.connection.clone();
        let fields = ::redis::cmd("HGETALL")
            .arg(key)
            .query_async::<HashMap<String, String>>(&mut connection)
            .await?;
        Ok(fields)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let mut connection = self.connection.clone();
        let reached = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<usize>(&mut connection)
            .await?;
        Ok(reached)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (sender, receiver) = broadcast::channel(self.capacity);
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(message) = messages.next().await {
                match message.get_payload::<String>() {
                    Ok(payload) => {
                        if sender.send(payload).is_err() {
                            // Every local receiver is gone.
                            break;
                        }
                    }
                    Err(e) => log::warn!("Undecodable payload on {channel_name}: {e}"),
                }
            }
            log::debug!("Redis subscription to {channel_name} closed");
        });

        Ok(Subscription::new(channel, receiver))
    }
}
