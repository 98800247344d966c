//! Redis Streams-backed message broker (feature `redis`).
//!
//! - **Stream per topic**: `{prefix}:{topic}`
//! - **Publish**: XADD; the returned stream entry id is the ack position
//! - **Subscribe**: one consumer group per broker instance, read with
//!   XREADGROUP on a background task and forwarded to the `Subscription`
//! - **Ack**: XACK once the entry is handed to the subscriber. Entries that
//!   were read but not handed off stay pending and are redelivered to the
//!   group on the next subscribe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use fluxora_core::EntryId;
use fluxora_events::{BrokerError, Message, MessageBroker, PublishAck, Subscription};

const DEFAULT_PREFIX: &str = "fluxora:stream";
const DEFAULT_GROUP: &str = "fluxora";
const READ_COUNT: usize = 32;
const BLOCK_MS: usize = 1_000;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    prefix: String,
    group: String,
    consumer: String,
}

impl RedisStreamsBroker {
    /// `redis_url` e.g. `redis://localhost:6379`.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Unavailable(format!("invalid redis url: {}", e)))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Consumer group shared by every subscriber of this broker instance.
    pub fn with_group(mut self, group: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.group = group.into();
        self.consumer = consumer.into();
        self
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(map_redis_error)
    }

    /// XGROUP CREATE ... MKSTREAM; an existing group is fine.
    async fn ensure_group(&self, conn: &mut MultiplexedConnection, key: &str) -> Result<(), BrokerError> {
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }
}

fn map_redis_error(err: redis::RedisError) -> BrokerError {
    BrokerError::Unavailable(err.to_string())
}

fn decode_entry(topic: &str, entry: &StreamId) -> Result<Message, BrokerError> {
    let field = |name: &str| -> Result<String, BrokerError> {
        entry
            .get::<String>(name)
            .ok_or_else(|| BrokerError::Serialization(format!("stream entry {} missing `{}`", entry.id, name)))
    };

    let id: EntryId = field("message_id")?
        .parse()
        .map_err(|e| BrokerError::Serialization(format!("message_id: {}", e)))?;
    let payload: JsonValue = serde_json::from_str(&field("payload")?)
        .map_err(|e| BrokerError::Serialization(format!("payload: {}", e)))?;
    let occurred_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&field("occurred_at")?)
        .map_err(|e| BrokerError::Serialization(format!("occurred_at: {}", e)))?
        .with_timezone(&Utc);
    let headers: BTreeMap<String, String> = match entry.get::<String>("headers") {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| BrokerError::Serialization(format!("headers: {}", e)))?,
        None => BTreeMap::new(),
    };

    let mut message = Message::new(topic, payload).with_id(id).with_occurred_at(occurred_at);
    if let Some(key) = entry.get::<String>("partition_key") {
        message = message.with_partition_key(key);
    }
    for (name, value) in headers {
        message = message.with_header(name, value);
    }
    Ok(message)
}

#[async_trait]
impl MessageBroker for RedisStreamsBroker {
    #[instrument(skip(self, message), fields(topic = %message.topic(), message_id = %message.id()), err)]
    async fn publish(&self, message: Message) -> Result<PublishAck, BrokerError> {
        let payload = serde_json::to_string(message.payload())
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let headers = serde_json::to_string(message.headers())
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let key = self.stream_key(message.topic());

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&key)
            .arg("*")
            .arg("message_id")
            .arg(message.id().to_string())
            .arg("occurred_at")
            .arg(message.occurred_at().to_rfc3339())
            .arg("headers")
            .arg(&headers)
            .arg("payload")
            .arg(&payload);
        if let Some(partition_key) = message.partition_key() {
            cmd.arg("partition_key").arg(partition_key);
        }

        let mut conn = self.connection().await?;
        let position: String = cmd.query_async(&mut conn).await.map_err(map_redis_error)?;

        Ok(PublishAck {
            message_id: message.id(),
            topic: message.topic().to_string(),
            position,
        })
    }

    #[instrument(skip(self), fields(group = %self.group, consumer = %self.consumer), err)]
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let key = self.stream_key(topic);
        let mut conn = self.connection().await?;
        self.ensure_group(&mut conn, &key).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let broker = self.clone();
        let topic_name = topic.to_string();
        tokio::spawn(async move { broker.read_loop(conn, key, topic_name, tx).await });

        Ok(Subscription::new(topic, rx))
    }
}

impl RedisStreamsBroker {
    async fn read_loop(
        &self,
        mut conn: MultiplexedConnection,
        key: String,
        topic: String,
        tx: mpsc::UnboundedSender<Message>,
    ) {
        // Pending entries from an earlier consumer session first, then new ones.
        let mut cursor = "0".to_string();

        while !tx.is_closed() {
            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(READ_COUNT)
                .block(BLOCK_MS);

            let reply: redis::RedisResult<Option<StreamReadReply>> =
                conn.xread_options(&[&key], &[&cursor], &opts).await;
            let reply = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(stream = %key, error = %err, "XREADGROUP failed; retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            let entries: Vec<StreamId> = reply
                .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
                .unwrap_or_default();
            if entries.is_empty() {
                if cursor != ">" {
                    debug!(stream = %key, "pending entries drained");
                    cursor = ">".to_string();
                }
                continue;
            }

            let mut handed_off = Vec::with_capacity(entries.len());
            for entry in &entries {
                match decode_entry(&topic, entry) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(stream = %key, entry_id = %entry.id, error = %err, "skipping undecodable stream entry");
                    }
                }
                handed_off.push(entry.id.clone());
            }

            if !handed_off.is_empty() {
                let acked: redis::RedisResult<u64> = conn.xack(&key, &self.group, &handed_off[..]).await;
                if let Err(err) = acked {
                    warn!(stream = %key, error = %err, "XACK failed; entries will be redelivered");
                }
            }
        }

        debug!(stream = %key, "subscription dropped; reader stopped");
    }
}
