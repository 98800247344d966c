use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fluxora_core::EntryId;
use fluxora_events::Message;

/// Dispatch status of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for the relay.
    Pending,
    /// Broker confirmed delivery; retained until the audit window passes.
    Dispatched,
    /// Dispatch budget exhausted; the entry was handed to the dead-letter queue.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Dispatched => "dispatched",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// An event captured in the same unit of work as a business change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Dedupe key; travels as the published message id.
    pub id: EntryId,
    pub topic: String,
    pub partition_key: Option<String>,
    pub payload: JsonValue,
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Store-assigned position; relay order within a partition.
    pub sequence: u64,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// `created_at` should come from the caller's `Clock`.
    pub fn new(topic: impl Into<String>, payload: JsonValue, created_at: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            topic: topic.into(),
            partition_key: None,
            payload,
            headers: BTreeMap::new(),
            created_at,
            sequence: 0,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            dispatched_at: None,
        }
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }

    /// The broker message for this entry. Same id on every dispatch attempt.
    pub fn to_message(&self) -> Message {
        let mut message = Message::new(self.topic.clone(), self.payload.clone())
            .with_id(self.id)
            .with_occurred_at(self.created_at);
        if let Some(key) = &self.partition_key {
            message = message.with_partition_key(key.clone());
        }
        for (name, value) in &self.headers {
            message = message.with_header(name.clone(), value.clone());
        }
        message
    }
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub dispatched: usize,
    pub dead_lettered: usize,
    /// Left pending for a later pass (broker down, partition blocked, budget left).
    pub deferred: usize,
}

impl RelayReport {
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0 && self.dead_lettered == 0 && self.deferred == 0
    }
}
