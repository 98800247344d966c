//! In-memory broker for tests/dev.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{BrokerError, MessageBroker, PublishAck, Subscription};
use crate::message::Message;

/// In-memory pub/sub broker.
///
/// - Fan-out per topic to every live subscription
/// - Keeps the full publish history for assertions
/// - Fault injection (`fail_next_publishes`, `set_available`) to exercise
///   the retry and breaker paths without a real transport
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    inner: Mutex<BrokerState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Message>>>,
    published: Vec<Message>,
    next_position: u64,
    failures_pending: usize,
    unavailable: bool,
    rejected_topics: Vec<String>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail with `BrokerError::Unavailable`.
    pub fn fail_next_publishes(&self, n: usize) {
        self.with_state(|s| s.failures_pending = n);
    }

    /// Toggle a hard outage. While unavailable every publish fails.
    pub fn set_available(&self, available: bool) {
        self.with_state(|s| s.unavailable = !available);
    }

    /// Reject every publish to `topic` with `BrokerError::Rejected`.
    pub fn reject_topic(&self, topic: impl Into<String>) {
        let topic = topic.into();
        self.with_state(|s| s.rejected_topics.push(topic));
    }

    /// Every message accepted so far, in publish order.
    pub fn published(&self) -> Vec<Message> {
        self.with_state(|s| s.published.clone())
    }

    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        self.with_state(|s| {
            s.published
                .iter()
                .filter(|m| m.topic() == topic)
                .cloned()
                .collect()
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        // Every mutation below leaves the state consistent, so a poisoned
        // lock is safe to reuse.
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: Message) -> Result<PublishAck, BrokerError> {
        self.with_state(|s| {
            if s.unavailable {
                return Err(BrokerError::Unavailable("broker is down".into()));
            }
            if s.failures_pending > 0 {
                s.failures_pending -= 1;
                return Err(BrokerError::Unavailable("injected publish failure".into()));
            }
            if s.rejected_topics.iter().any(|t| t == message.topic()) {
                return Err(BrokerError::Rejected(format!(
                    "topic '{}' does not accept messages",
                    message.topic()
                )));
            }

            s.next_position += 1;
            let ack = PublishAck {
                message_id: message.id(),
                topic: message.topic().to_string(),
                position: s.next_position.to_string(),
            };

            if let Some(subs) = s.subscribers.get_mut(message.topic()) {
                // Drop dead subscribers while publishing.
                subs.retain(|tx| tx.send(message.clone()).is_ok());
            }
            s.published.push(message);

            Ok(ack)
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|s| s.subscribers.entry(topic.to_string()).or_default().push(tx));
        Ok(Subscription::new(topic, rx))
    }
}
