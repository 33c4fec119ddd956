//! Networked coordination store.
//!
//! Wire format: one JSON object per line.
//!
//! ```text
//! → {"op":"incr","key":"room:r1:connectionId"}
//! ← {"ok":3}
//! → {"op":"subscribe","channel":"rooms_channel"}
//! ← {"ok":null}
//! ← {"message":"{\"roomId\":\"r1\",...}"}        (pushed, repeated)
//! ```
//!
//! A connection that subscribes becomes push-only. [`RemoteStore`] therefore
//! keeps one command connection (requests serialized behind a mutex) and
//! opens a dedicated connection per subscription.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use super::{CoordinationStore, MemoryStore, StoreError, Subscription};

/// Requests understood by [`StoreServer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum StoreRequest {
    Incr { key: String },
    SetField { key: String, field: String, value: String },
    DeleteField { key: String, field: String },
    Fields { key: String },
    Publish { channel: String, payload: String },
    Subscribe { channel: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreReply {
    Ok(Value),
    Err(String),
    Message(String),
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<(), StoreError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Server
// ───────────────────────────────────────────────────────────────────

/// Serves a [`MemoryStore`] to remote nodes.
#[derive(Clone)]
pub struct StoreServer {
    store: Arc<MemoryStore>,
}

impl StoreServer {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self, bind_addr: &str) -> Result<(), StoreError> {
        let listener = TcpListener::bind(bind_addr).await?;
        log::info!("Coordination store listening on {bind_addr}");
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), StoreError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("Store client connected from {addr}");

            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, store).await {
                    log::warn!("Store client {addr} failed: {e}");
                }
                log::debug!("Store client {addr} disconnected");
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        store: Arc<MemoryStore>,
    ) -> Result<(), StoreError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<StoreRequest>(&line) {
                Ok(request) => request,
                Err(e) => {
                    write_line(&mut writer, &StoreReply::Err(e.to_string())).await?;
                    continue;
                }
            };

            if let StoreRequest::Subscribe { channel } = request {
                let subscription = store.subscribe(&channel).await?;
                write_line(&mut writer, &StoreReply::Ok(Value::Null)).await?;
                return Self::push_messages(subscription, lines, writer).await;
            }

            let reply = match Self::execute(&store, request).await {
                Ok(value) => StoreReply::Ok(value),
                Err(e) => StoreReply::Err(e.to_string()),
            };
            write_line(&mut writer, &reply).await?;
        }

        Ok(())
    }

    /// Forward channel payloads until either side goes away.
    async fn push_messages(
        mut subscription: Subscription,
        mut lines: Lines<BufReader<OwnedReadHalf>>,
        mut writer: OwnedWriteHalf,
    ) -> Result<(), StoreError> {
        loop {
            tokio::select! {
                payload = subscription.recv() => match payload {
                    Some(payload) => write_line(&mut writer, &StoreReply::Message(payload)).await?,
                    None => return Ok(()),
                },
                line = lines.next_line() => {
                    // Input on a subscriber connection is ignored; EOF ends it.
                    if line?.is_none() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn execute(store: &MemoryStore, request: StoreRequest) -> Result<Value, StoreError> {
        let value = match request {
            StoreRequest::Incr { key } => Value::from(store.incr(&key).await?),
            StoreRequest::SetField { key, field, value } => {
                store.set_field(&key, &field, &value).await?;
                Value::Null
            }
            StoreRequest::DeleteField { key, field } => {
                Value::Bool(store.delete_field(&key, &field).await?)
            }
            StoreRequest::Fields { key } => serde_json::to_value(store.fields(&key).await?)?,
            StoreRequest::Publish { channel, payload } => {
                Value::from(store.publish(&channel, &payload).await? as u64)
            }
            StoreRequest::Subscribe { .. } => {
                return Err(StoreError::Remote(
                    "subscribe must be handled by the connection loop".to_string(),
                ))
            }
        };
        Ok(value)
    }
}

// ───────────────────────────────────────────────────────────────────
// Client
// ───────────────────────────────────────────────────────────────────

struct CommandConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl CommandConnection {
    async fn open(addr: &str) -> Result<Self, StoreError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn round_trip(&mut self, request: &StoreRequest) -> Result<StoreReply, StoreError> {
        write_line(&mut self.writer, request).await?;
        let line = self.lines.next_line().await?.ok_or(StoreError::Closed)?;
        Ok(serde_json::from_str(&line)?)
    }
}

/// Client for a [`StoreServer`].
///
/// A broken command connection is dropped and reopened on the next
/// request; the failed request itself is not retried.
pub struct RemoteStore {
    addr: String,
    command: Mutex<Option<CommandConnection>>,
    capacity: usize,
}

impl RemoteStore {
    /// Connect eagerly so a bad address fails at startup.
    pub async fn connect(addr: impl Into<String>) -> Result<Self, StoreError> {
        let addr = addr.into();
        let connection = CommandConnection::open(&addr).await?;
        Ok(Self {
            addr,
            command: Mutex::new(Some(connection)),
            capacity: 1024,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn request(&self, request: StoreRequest) -> Result<Value, StoreError> {
        let mut guard = self.command.lock().await;
        if guard.is_none() {
            *guard = Some(CommandConnection::open(&self.addr).await?);
        }
        let Some(connection) = guard.as_mut() else {
            return Err(StoreError::Closed);
        };

        let result = connection.round_trip(&request).await;
        if result.is_err() {
            *guard = None;
        }

        match result? {
            StoreReply::Ok(value) => Ok(value),
            StoreReply::Err(message) => Err(StoreError::Remote(message)),
            StoreReply::Message(_) => Err(StoreError::UnexpectedReply(
                "push message on a command connection".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let value = self
            .request(StoreRequest::Incr { key: key.to_string() })
            .await?;
        value
            .as_i64()
            .ok_or_else(|| StoreError::UnexpectedReply(value.to_string()))
    }

    async fn set_field(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.request(StoreRequest::SetField {
            key: key.to_string(),
            field: field.to_string(),
            value: value.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn delete_field(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let value = self
            .request(StoreRequest::DeleteField {
                key: key.to_string(),
                field: field.to_string(),
            })
            .await?;
        value
            .as_bool()
            .ok_or_else(|| StoreError::UnexpectedReply(value.to_string()))
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let value = self
            .request(StoreRequest::Fields { key: key.to_string() })
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let value = self
            .request(StoreRequest::Publish {
                channel: channel.to_string(),
                payload: payload.to_string(),
            })
            .await?;
        value
            .as_u64()
            .map(|count| count as usize)
            .ok_or_else(|| StoreError::UnexpectedReply(value.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut connection = CommandConnection::open(&self.addr).await?;
        let request = StoreRequest::Subscribe {
            channel: channel.to_string(),
        };
        match connection.round_trip(&request).await? {
            StoreReply::Ok(_) => {}
            StoreReply::Err(message) => return Err(StoreError::Remote(message)),
            StoreReply::Message(_) => {
                return Err(StoreError::UnexpectedReply(
                    "push message before subscribe ack".to_string(),
                ))
            }
        }

        let (sender, receiver) = broadcast::channel(self.capacity);
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            // Keep the write half alive; dropping it would end the subscription.
            let CommandConnection { mut lines, writer: _writer } = connection;
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Subscription to {channel_name} failed: {e}");
                        break;
                    }
                };
                match serde_json::from_str::<StoreReply>(&line) {
                    Ok(StoreReply::Message(payload)) => {
                        if sender.send(payload).is_err() {
                            // Every local receiver is gone.
                            break;
                        }
                    }
                    Ok(other) => log::warn!("Ignoring {other:?} on subscription {channel_name}"),
                    Err(e) => log::warn!("Malformed push on subscription {channel_name}: {e}"),
                }
            }
            log::debug!("Subscription to {channel_name} closed");
        });

        Ok(Subscription::new(channel, receiver))
    }
}
