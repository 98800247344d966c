//! Dead-letter entry model.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use fluxora_core::EntryId;
use fluxora_events::Message;

/// Header set on messages re-injected from the dead-letter queue.
pub const REPLAY_HEADER: &str = "x-dead-letter-replay";

/// Which part of the system gave up on the work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterOrigin {
    /// A message consumer exhausted its retries.
    Consumer,
    /// The outbox relay could not publish an entry.
    Outbox,
    /// A background job or saga step gave up.
    Job,
}

impl DeadLetterOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterOrigin::Consumer => "consumer",
            DeadLetterOrigin::Outbox => "outbox",
            DeadLetterOrigin::Job => "job",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Waiting for an operator.
    Parked,
    /// Discarded by an operator.
    Resolved {
        reason: String,
        resolved_at: DateTime<Utc>,
    },
}

/// A work item that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Same id as the original message / outbox entry, so parking is idempotent.
    pub id: EntryId,
    /// Source queue or topic; replay re-injects here.
    pub source: String,
    pub origin: DeadLetterOrigin,
    pub payload: JsonValue,
    pub partition_key: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Last error observed before giving up.
    pub error: String,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub status: DeadLetterStatus,
    /// Failed re-injection attempts.
    pub replay_attempts: u32,
    pub last_replay_error: Option<String>,
}

impl DeadLetterEntry {
    pub fn new(
        id: EntryId,
        source: impl Into<String>,
        origin: DeadLetterOrigin,
        payload: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source: source.into(),
            origin,
            payload,
            partition_key: None,
            headers: BTreeMap::new(),
            error: String::new(),
            attempts: 0,
            first_seen_at: now,
            last_attempt_at: now,
            dead_lettered_at: now,
            status: DeadLetterStatus::Parked,
            replay_attempts: 0,
            last_replay_error: None,
        }
    }

    /// Build an entry from a message a consumer gave up on.
    pub fn from_message(message: &Message, origin: DeadLetterOrigin, now: DateTime<Utc>) -> Self {
        let mut entry = Self::new(
            message.id(),
            message.topic(),
            origin,
            message.payload().clone(),
            now,
        );
        entry.partition_key = message.partition_key().map(str::to_string);
        entry.headers = message.headers().clone();
        entry
    }

    pub fn with_failure(mut self, error: impl Into<String>, attempts: u32) -> Self {
        self.error = error.into();
        self.attempts = attempts;
        self
    }

    pub fn with_partition_key(mut self, key: Option<String>) -> Self {
        self.partition_key = key;
        self
    }

    pub fn first_seen(mut self, at: DateTime<Utc>) -> Self {
        self.first_seen_at = at;
        self
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, DeadLetterStatus::Resolved { .. })
    }

    /// The message to re-inject on replay.
    pub fn to_message(&self) -> Message {
        let mut message = Message::new(self.source.clone(), self.payload.clone()).with_id(self.id);
        if let Some(key) = &self.partition_key {
            message = message.with_partition_key(key.clone());
        }
        for (name, value) in &self.headers {
            message = message.with_header(name.clone(), value.clone());
        }
        message.with_header(REPLAY_HEADER, (self.replay_attempts + 1).to_string())
    }
}

/// Query for `list` (filters + pagination).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub source: Option<String>,
    pub origin: Option<DeadLetterOrigin>,
    pub include_resolved: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl DeadLetterFilter {
    /// Everything, resolved entries included.
    pub fn all() -> Self {
        Self {
            include_resolved: true,
            ..Default::default()
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn origin(mut self, origin: DeadLetterOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn include_resolved(mut self, include: bool) -> Self {
        self.include_resolved = include;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        if !self.include_resolved && entry.is_resolved() {
            return false;
        }
        if let Some(source) = &self.source {
            if &entry.source != source {
                return false;
            }
        }
        if let Some(origin) = self.origin {
            if entry.origin != origin {
                return false;
            }
        }
        true
    }

    /// Apply filter, newest-first ordering and pagination to a full listing.
    pub fn apply<'a, I>(&self, entries: I) -> Vec<DeadLetterEntry>
    where
        I: IntoIterator<Item = &'a DeadLetterEntry>,
    {
        let mut matched: Vec<DeadLetterEntry> =
            entries.into_iter().filter(|e| self.matches(e)).cloned().collect();
        matched.sort_by(|a, b| {
            b.dead_lettered_at
                .cmp(&a.dead_lettered_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub parked: usize,
    pub resolved: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub parked: usize,
    pub resolved: usize,
    pub by_source: HashMap<String, SourceStats>,
}

impl DeadLetterStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DeadLetterEntry>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            let per_source = stats.by_source.entry(entry.source.clone()).or_default();
            if entry.is_resolved() {
                stats.resolved += 1;
                per_source.resolved += 1;
            } else {
                stats.parked += 1;
                per_source.parked += 1;
            }
        }
        stats
    }
}
