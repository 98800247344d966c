use std::sync::Arc;

use tracing::{info, warn};

use fluxora_core::{EntryId, ResilienceError, ResilienceResult, SharedClock};
use fluxora_events::{MessageBroker, PublishAck};
use fluxora_observability::{ResilienceEvent, SharedMetricsSink};

use super::store::DeadLetterStore;
use super::types::{DeadLetterEntry, DeadLetterFilter, DeadLetterStats, DeadLetterStatus};

/// Operator-facing dead-letter queue.
///
/// Entries leave the queue only through a successful `replay`; `discard`
/// marks them resolved but keeps them for audit.
#[derive(Clone)]
pub struct DeadLetterQueue {
    store: Arc<dyn DeadLetterStore>,
    broker: Arc<dyn MessageBroker>,
    clock: SharedClock,
    metrics: SharedMetricsSink,
}

impl std::fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue").finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    pub fn new(
        store: Arc<dyn DeadLetterStore>,
        broker: Arc<dyn MessageBroker>,
        clock: SharedClock,
        metrics: SharedMetricsSink,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            metrics,
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Park an entry. Parking the same id twice keeps the first entry and
    /// returns `false`.
    pub async fn park(&self, mut entry: DeadLetterEntry) -> ResilienceResult<bool> {
        entry.dead_lettered_at = self.clock.utc_now();
        entry.status = DeadLetterStatus::Parked;

        let id = entry.id;
        let source = entry.source.clone();
        let attempts = entry.attempts;
        let error = entry.error.clone();

        let inserted = self.store.insert(entry).await?;
        if inserted {
            warn!(
                entry_id = %id,
                source = %source,
                attempts,
                error = %error,
                "entry moved to dead-letter queue"
            );
            self.metrics
                .record(ResilienceEvent::EntryDeadLettered { source, attempts });
        } else {
            info!(entry_id = %id, source = %source, "entry already dead-lettered");
        }
        Ok(inserted)
    }

    pub async fn get(&self, id: EntryId) -> ResilienceResult<DeadLetterEntry> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ResilienceError::not_found(format!("dead-letter entry {id}")))
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> ResilienceResult<Vec<DeadLetterEntry>> {
        self.store.list(filter).await
    }

    /// Re-inject an entry into its source queue.
    ///
    /// The entry is removed only after the broker confirms the publish; a
    /// failed re-injection bumps `replay_attempts` and keeps the entry.
    pub async fn replay(&self, id: EntryId) -> ResilienceResult<PublishAck> {
        let mut entry = self.get(id).await?;
        if entry.is_resolved() {
            return Err(ResilienceError::invalid_state(format!(
                "dead-letter entry {id} is resolved and cannot be replayed"
            )));
        }

        match self.broker.publish(entry.to_message()).await {
            Ok(ack) => {
                self.store.remove(id).await?;
                info!(entry_id = %id, source = %entry.source, position = %ack.position, "dead-letter entry replayed");
                self.metrics.record(ResilienceEvent::DeadLetterReplayed {
                    source: entry.source,
                });
                Ok(ack)
            }
            Err(err) => {
                entry.replay_attempts += 1;
                entry.last_replay_error = Some(err.to_string());
                self.store.update(&entry).await?;
                warn!(
                    entry_id = %id,
                    replay_attempts = entry.replay_attempts,
                    error = %err,
                    "dead-letter replay failed; entry kept"
                );
                Err(err.into())
            }
        }
    }

    /// Mark an entry resolved without re-injecting it.
    pub async fn discard(&self, id: EntryId, reason: impl Into<String>) -> ResilienceResult<DeadLetterEntry> {
        let mut entry = self.get(id).await?;
        if entry.is_resolved() {
            return Err(ResilienceError::invalid_state(format!(
                "dead-letter entry {id} is already resolved"
            )));
        }
        let reason = reason.into();
        entry.status = DeadLetterStatus::Resolved {
            reason: reason.clone(),
            resolved_at: self.clock.utc_now(),
        };
        self.store.update(&entry).await?;
        info!(entry_id = %id, source = %entry.source, reason = %reason, "dead-letter entry discarded");
        self.metrics.record(ResilienceEvent::DeadLetterDiscarded {
            source: entry.source.clone(),
        });
        Ok(entry)
    }

    pub async fn stats(&self) -> ResilienceResult<DeadLetterStats> {
        let entries = self.store.list(&DeadLetterFilter::all()).await?;
        Ok(DeadLetterStats::from_entries(&entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::store::InMemoryDeadLetterStore;
    use crate::dlq::types::DeadLetterOrigin;
    use fluxora_core::ManualClock;
    use fluxora_events::{InMemoryBroker, Message};
    use fluxora_observability::InMemoryMetricsSink;
    use serde_json::json;

    struct Fixture {
        dlq: DeadLetterQueue,
        store: Arc<InMemoryDeadLetterStore>,
        broker: Arc<InMemoryBroker>,
        metrics: Arc<InMemoryMetricsSink>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryDeadLetterStore::arc();
        let broker = Arc::new(InMemoryBroker::new());
        let metrics = InMemoryMetricsSink::shared();
        let dlq = DeadLetterQueue::new(
            store.clone(),
            broker.clone(),
            ManualClock::new().shared(),
            metrics.clone(),
        );
        Fixture {
            dlq,
            store,
            broker,
            metrics,
        }
    }

    fn parked(topic: &str) -> DeadLetterEntry {
        let msg = Message::new(topic, json!({"reading": 1}));
        DeadLetterEntry::from_message(&msg, DeadLetterOrigin::Consumer, chrono::Utc::now())
            .with_failure("handler failed", 3)
    }

    #[tokio::test]
    async fn replay_reinjects_then_removes() {
        let f = fixture();
        let entry = parked("meter-readings");
        let id = entry.id;
        assert!(f.dlq.park(entry).await.unwrap());

        let ack = f.dlq.replay(id).await.unwrap();
        assert_eq!(ack.message_id, id);
        assert_eq!(f.broker.published_to("meter-readings").len(), 1);
        assert!(f.store.is_empty());
        assert_eq!(f.metrics.count("dead_letter_replayed_total"), 1);
    }

    #[tokio::test]
    async fn failed_replay_keeps_the_entry() {
        let f = fixture();
        let entry = parked("meter-readings");
        let id = entry.id;
        f.dlq.park(entry).await.unwrap();

        f.broker.set_available(false);
        let err = f.dlq.replay(id).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Broker(_)));

        let kept = f.dlq.get(id).await.unwrap();
        assert_eq!(kept.replay_attempts, 1);
        assert!(kept.last_replay_error.is_some());

        f.broker.set_available(true);
        f.dlq.replay(id).await.unwrap();
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn discarded_entries_stay_visible_but_cannot_be_replayed() {
        let f = fixture();
        let entry = parked("meter-readings");
        let id = entry.id;
        f.dlq.park(entry).await.unwrap();

        let resolved = f.dlq.discard(id, "duplicate reading").await.unwrap();
        assert!(resolved.is_resolved());
        assert!(matches!(
            f.dlq.replay(id).await,
            Err(ResilienceError::InvalidState(_))
        ));
        assert!(f.dlq.list(&DeadLetterFilter::default()).await.unwrap().is_empty());
        assert_eq!(f.dlq.list(&DeadLetterFilter::all()).await.unwrap().len(), 1);

        let stats = f.dlq.stats().await.unwrap();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.parked, 0);
    }

    #[tokio::test]
    async fn parking_twice_records_one_entry() {
        let f = fixture();
        let entry = parked("q");
        assert!(f.dlq.park(entry.clone()).await.unwrap());
        assert!(!f.dlq.park(entry).await.unwrap());
        assert_eq!(f.store.len(), 1);
        assert_eq!(f.metrics.count("dead_lettered_total"), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let f = fixture();
        assert!(matches!(
            f.dlq.replay(EntryId::new()).await,
            Err(ResilienceError::NotFound(_))
        ));
    }
}
