use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fluxora_core::EntryId;

/// A unit of work travelling through the broker.
///
/// Notes:
/// - `id` is the dedupe key. Messages relayed from the outbox carry the outbox
///   entry id, so a redelivered message keeps its identity.
/// - `partition_key` scopes ordering: messages with the same key are delivered
///   in publish order, nothing is promised across keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: EntryId,
    topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<String>,
    payload: JsonValue,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    occurred_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: EntryId::new(),
            topic: topic.into(),
            partition_key: None,
            payload,
            headers: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }
}
