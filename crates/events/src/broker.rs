//! Broker client abstraction (publish / consume, at-least-once).
//!
//! Implementations must be safe to share across tasks. A successful
//! `publish` means the broker confirmed the write; anything short of that is
//! an error and the caller (usually the outbox relay) keeps the message.
//!
//! Consumers must be idempotent: the same message id can be delivered more
//! than once.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use fluxora_core::{EntryId, ResilienceError};

use crate::message::Message;

/// Confirmation returned by the broker for a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub message_id: EntryId,
    pub topic: String,
    /// Transport position (stream id, offset, ...).
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Transport is down or timed out; worth retrying.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Broker refused the message; retrying the same message will not help.
    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("broker closed")]
    Closed,
}

impl From<BrokerError> for ResilienceError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) => ResilienceError::broker(msg),
            BrokerError::Closed => ResilienceError::broker("broker closed"),
            BrokerError::Rejected(msg) => ResilienceError::non_retryable(msg),
            BrokerError::Serialization(msg) => ResilienceError::non_retryable(msg),
        }
    }
}

/// A stream of messages delivered for one topic.
///
/// Single consumer. `recv` returns `None` once the broker side is gone.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Take a message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, message: Message) -> Result<PublishAck, BrokerError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;
}

#[async_trait]
impl<B> MessageBroker for Arc<B>
where
    B: MessageBroker + ?Sized,
{
    async fn publish(&self, message: Message) -> Result<PublishAck, BrokerError> {
        (**self).publish(message).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        (**self).subscribe(topic).await
    }
}
