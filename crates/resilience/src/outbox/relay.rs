//! Background relay: pending outbox entries → broker.
//!
//! Each pass reads a batch of pending entries in creation order and publishes
//! them through the breaker + retry wrapped broker client.
//!
//! - Confirmed delivery marks the entry `Dispatched`.
//! - An open broker circuit defers the rest of the batch; no budget is spent.
//! - Transient failures count against `max_dispatch_attempts`; the entry stays
//!   pending until the budget is gone, then it is parked in the dead-letter
//!   queue and marked `Failed`.
//! - A deferred or failed entry blocks later entries with the same partition
//!   key for the rest of the pass.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fluxora_core::{ResilienceError, ResilienceResult, SharedClock};
use fluxora_events::MessageBroker;
use fluxora_observability::{ResilienceEvent, SharedMetricsSink};

use crate::caller::{CallSpec, ResilientCaller};
use crate::config::duration_ms;
use crate::dlq::{DeadLetterEntry, DeadLetterOrigin, DeadLetterQueue};
use crate::retry::RetryPolicy;

use super::store::OutboxStore;
use super::types::{OutboxEntry, RelayReport};

const PURGE_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    #[serde(with = "duration_ms", rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// How long dispatched entries are kept for audit.
    #[serde(with = "duration_ms", rename = "retention_ms")]
    pub retention: Duration,
    /// Breaker / pool name used for broker calls.
    pub broker_dependency: String,
    /// Total publish attempts per entry, across passes.
    pub max_dispatch_attempts: u32,
    /// Retries within a single pass.
    pub publish_retry: RetryPolicy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            retention: Duration::from_secs(7 * 24 * 3600),
            broker_dependency: "message-broker".to_string(),
            max_dispatch_attempts: 5,
            publish_retry: RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(2)),
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.batch_size == 0 {
            return Err(ResilienceError::config("outbox.batch_size must be > 0"));
        }
        if self.max_dispatch_attempts == 0 {
            return Err(ResilienceError::config("outbox.max_dispatch_attempts must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(ResilienceError::config("outbox.poll_interval_ms must be > 0"));
        }
        self.publish_retry.validate()
    }
}

enum Dispatch {
    Delivered,
    Deferred { broker_down: bool },
    DeadLettered,
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    caller: ResilientCaller,
    dlq: DeadLetterQueue,
    config: OutboxConfig,
    clock: SharedClock,
    metrics: SharedMetricsSink,
}

impl std::fmt::Debug for OutboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxRelay")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        caller: ResilientCaller,
        dlq: DeadLetterQueue,
        config: OutboxConfig,
        clock: SharedClock,
        metrics: SharedMetricsSink,
    ) -> Self {
        Self {
            store,
            broker,
            caller,
            dlq,
            config,
            clock,
            metrics,
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// One relay pass.
    pub async fn run_once(&self) -> ResilienceResult<RelayReport> {
        self.run_pass(&CancellationToken::new()).await
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> ResilienceResult<RelayReport> {
        let batch = self.store.fetch_pending(self.config.batch_size).await?;
        let mut report = RelayReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut broker_down = false;

        for entry in batch {
            let partition_blocked = entry
                .partition_key
                .as_ref()
                .is_some_and(|k| blocked.contains(k));
            if broker_down || partition_blocked {
                report.deferred += 1;
                continue;
            }

            match self.dispatch(&entry, cancel).await? {
                Dispatch::Delivered => report.dispatched += 1,
                Dispatch::Deferred { broker_down: down } => {
                    report.deferred += 1;
                    broker_down |= down;
                    if let Some(key) = entry.partition_key {
                        blocked.insert(key);
                    }
                }
                Dispatch::DeadLettered => {
                    report.dead_lettered += 1;
                    if let Some(key) = entry.partition_key {
                        blocked.insert(key);
                    }
                }
            }
        }

        if !report.is_idle() {
            debug!(
                dispatched = report.dispatched,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                "outbox relay pass"
            );
        }
        Ok(report)
    }

    async fn dispatch(&self, entry: &OutboxEntry, cancel: &CancellationToken) -> ResilienceResult<Dispatch> {
        let remaining = self.config.max_dispatch_attempts.saturating_sub(entry.attempts);
        if remaining == 0 {
            let last = entry.last_error.clone().unwrap_or_else(|| "dispatch budget exhausted".into());
            self.dead_letter(entry, entry.attempts, &last).await?;
            return Ok(Dispatch::DeadLettered);
        }

        let mut policy = self.config.publish_retry.clone();
        policy.max_attempts = policy.max_attempts.clamp(1, remaining);
        let spec = CallSpec::new(self.config.broker_dependency.clone());
        let message = entry.to_message();
        let invoked = AtomicU32::new(0);

        let result = self
            .caller
            .call(&spec, &policy, cancel, |_| {
                let message = message.clone();
                let invoked = &invoked;
                let broker = &self.broker;
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    broker.publish(message).await.map_err(ResilienceError::from)
                }
            })
            .await;

        let made = invoked.load(Ordering::SeqCst);
        let attempts = entry.attempts + made;

        let err = match result {
            Ok(ack) => {
                self.store
                    .mark_dispatched(entry.id, attempts, self.clock.utc_now())
                    .await?;
                debug!(entry_id = %entry.id, topic = %entry.topic, position = %ack.position, attempts, "outbox entry dispatched");
                self.metrics.record(ResilienceEvent::OutboxDispatched {
                    topic: entry.topic.clone(),
                });
                return Ok(Dispatch::Delivered);
            }
            Err(err) => err,
        };

        if err == ResilienceError::Cancelled {
            if made > 0 {
                self.store.record_attempts(entry.id, attempts, "cancelled").await?;
            }
            return Err(ResilienceError::Cancelled);
        }

        let cause = err.root_cause();
        if matches!(cause, ResilienceError::CircuitOpen { .. }) {
            if made > 0 {
                self.store
                    .record_attempts(entry.id, attempts, &cause.to_string())
                    .await?;
            }
            info!(entry_id = %entry.id, "broker circuit open; deferring remaining outbox entries");
            return Ok(Dispatch::Deferred { broker_down: true });
        }

        let retryable = policy.classifier.is_retryable(cause);
        if !retryable || attempts >= self.config.max_dispatch_attempts {
            self.dead_letter(entry, attempts, &cause.to_string()).await?;
            return Ok(Dispatch::DeadLettered);
        }

        self.store
            .record_attempts(entry.id, attempts, &cause.to_string())
            .await?;
        debug!(entry_id = %entry.id, attempts, error = %cause, "outbox dispatch deferred");
        Ok(Dispatch::Deferred { broker_down: false })
    }

    async fn dead_letter(&self, entry: &OutboxEntry, attempts: u32, error: &str) -> ResilienceResult<()> {
        let exhausted = ResilienceError::DispatchExhausted {
            entry_id: entry.id,
            attempts,
        };
        warn!(entry_id = %entry.id, topic = %entry.topic, error = %exhausted, cause = %error, "outbox dispatch exhausted");

        let mut parked = DeadLetterEntry::new(
            entry.id,
            entry.topic.clone(),
            DeadLetterOrigin::Outbox,
            entry.payload.clone(),
            self.clock.utc_now(),
        )
        .with_failure(error, attempts)
        .with_partition_key(entry.partition_key.clone())
        .first_seen(entry.created_at);
        parked.headers = entry.headers.clone();

        // Park before marking failed: a crash in between leaves the entry
        // pending, and parking again is a no-op.
        self.dlq.park(parked).await?;
        self.store.mark_failed(entry.id, attempts, error).await
    }

    /// Run the relay in a background task until the token fires or the
    /// handle is shut down.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> RelayHandle {
        let wake = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(RelayStats::default()));

        let join = {
            let cancel = cancel.clone();
            let wake = wake.clone();
            let stats = stats.clone();
            tokio::spawn(async move { self.relay_loop(cancel, wake, stats).await })
        };

        RelayHandle {
            cancel,
            wake,
            join,
            stats,
        }
    }

    async fn relay_loop(&self, cancel: CancellationToken, wake: Arc<Notify>, stats: Arc<Mutex<RelayStats>>) {
        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "outbox relay started"
        );
        let mut last_purge = tokio::time::Instant::now();

        loop {
            let pass = self.run_pass(&cancel).await;
            {
                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                s.passes += 1;
                match &pass {
                    Ok(report) => s.record(*report),
                    Err(ResilienceError::Cancelled) => {}
                    Err(err) => {
                        s.errors += 1;
                        s.last_error = Some(err.to_string());
                    }
                }
            }
            match pass {
                Err(ResilienceError::Cancelled) => break,
                Err(err) => error!(error = %err, "outbox relay pass failed"),
                Ok(_) => {}
            }

            if last_purge.elapsed() >= PURGE_EVERY {
                last_purge = tokio::time::Instant::now();
                let cutoff = self.clock.utc_now()
                    - chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::MAX);
                match self.store.purge_dispatched(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => {
                        debug!(purged = n, "purged dispatched outbox entries");
                        stats.lock().unwrap_or_else(|e| e.into_inner()).purged += n as u64;
                    }
                    Err(err) => warn!(error = %err, "outbox purge failed"),
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        info!("outbox relay stopped");
    }
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub passes: u64,
    pub dispatched: u64,
    pub dead_lettered: u64,
    pub deferred_last_pass: usize,
    pub purged: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

impl RelayStats {
    fn record(&mut self, report: RelayReport) {
        self.dispatched += report.dispatched as u64;
        self.dead_lettered += report.dead_lettered as u64;
        self.deferred_last_pass = report.deferred;
    }
}

/// Handle to control a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Run a pass now instead of waiting for the poll interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Request graceful shutdown and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "outbox relay task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakersConfig, CircuitBreakerRegistry};
    use crate::dlq::{DeadLetterFilter, DeadLetterStore, InMemoryDeadLetterStore};
    use crate::outbox::{InMemoryOutboxStore, OutboxStatus};
    use crate::resource::{PoolsConfig, ResourceManager};
    use crate::retry::RetryExecutor;
    use fluxora_core::{Clock, ManualClock};
    use fluxora_events::InMemoryBroker;
    use fluxora_observability::{InMemoryMetricsSink, NoopMetricsSink};
    use serde_json::json;

    struct Fixture {
        clock: ManualClock,
        relay: Arc<OutboxRelay>,
        store: Arc<InMemoryOutboxStore>,
        broker: Arc<InMemoryBroker>,
        dlq_store: Arc<InMemoryDeadLetterStore>,
        caller: ResilientCaller,
        metrics: Arc<InMemoryMetricsSink>,
    }

    fn fixture(config: OutboxConfig, breaker: BreakerConfig) -> Fixture {
        let manual = ManualClock::new();
        let clock = manual.shared();
        let metrics = InMemoryMetricsSink::shared();
        let store = InMemoryOutboxStore::arc();
        let broker = Arc::new(InMemoryBroker::new());
        let dlq_store = InMemoryDeadLetterStore::arc();
        let caller = ResilientCaller::new(
            Arc::new(ResourceManager::new(PoolsConfig::default(), clock.clone(), NoopMetricsSink::shared())),
            Arc::new(CircuitBreakerRegistry::new(
                BreakersConfig::default().with_override("message-broker", breaker),
                clock.clone(),
                metrics.clone(),
            )),
            RetryExecutor::new(NoopMetricsSink::shared()),
        );
        let dlq = DeadLetterQueue::new(dlq_store.clone(), broker.clone(), clock.clone(), metrics.clone());
        let relay = Arc::new(OutboxRelay::new(
            store.clone(),
            broker.clone(),
            caller.clone(),
            dlq,
            config,
            clock,
            metrics.clone(),
        ));
        Fixture {
            clock: manual,
            relay,
            store,
            broker,
            dlq_store,
            caller,
            metrics,
        }
    }

    fn quick_config(max_dispatch_attempts: u32, per_pass: u32) -> OutboxConfig {
        OutboxConfig {
            max_dispatch_attempts,
            publish_retry: RetryPolicy::fixed(per_pass, Duration::from_millis(1)),
            ..OutboxConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn committed_entries_are_published_with_their_id() {
        let f = fixture(OutboxConfig::default(), BreakerConfig::default());
        let mut tx = f.store.begin();
        let id = tx.enqueue(OutboxEntry::new("forecast.published", json!({"site": 4}), f.clock.utc_now()));
        tx.commit().unwrap();

        let report = f.relay.run_once().await.unwrap();
        assert_eq!(report.dispatched, 1);

        let published = f.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id(), id);

        let stored = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Dispatched);
        assert_eq!(stored.attempts, 1);
        assert_eq!(f.metrics.count("outbox_dispatched_total"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_timestamps_follow_the_injected_clock() {
        let f = fixture(OutboxConfig::default(), BreakerConfig::default());
        let created = f.clock.utc_now();
        let id = f
            .store
            .enqueue(OutboxEntry::new("forecast.published", json!({}), created))
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(300));
        f.relay.run_once().await.unwrap();

        assert_eq!(f.broker.published()[0].occurred_at(), created);
        let stored = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.created_at, created);
        assert_eq!(stored.dispatched_at, Some(created + chrono::Duration::seconds(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn rolled_back_entries_are_never_published() {
        let f = fixture(OutboxConfig::default(), BreakerConfig::default());
        let mut tx = f.store.begin();
        tx.enqueue(OutboxEntry::new("forecast.published", json!({}), f.clock.utc_now()));
        drop(tx);

        assert!(f.relay.run_once().await.unwrap().is_idle());
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_entries_are_parked_with_the_full_budget() {
        let f = fixture(quick_config(4, 3), BreakerConfig::new(100, 1, Duration::from_secs(1)));
        let id = f
            .store
            .enqueue(OutboxEntry::new("forecast.published", json!({}), f.clock.utc_now()))
            .await
            .unwrap();
        f.broker.set_available(false);

        let first = f.relay.run_once().await.unwrap();
        assert_eq!(first.deferred, 1);
        assert_eq!(f.store.get(id).await.unwrap().unwrap().attempts, 3);

        let second = f.relay.run_once().await.unwrap();
        assert_eq!(second.dead_lettered, 1);

        let stored = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.attempts, 4);

        let parked = f.dlq_store.list(&DeadLetterFilter::default()).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, id);
        assert_eq!(parked[0].attempts, 4);
        assert_eq!(parked[0].origin, DeadLetterOrigin::Outbox);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_messages_are_parked_immediately() {
        let f = fixture(quick_config(5, 3), BreakerConfig::default());
        f.broker.reject_topic("poison");
        f.store.enqueue(OutboxEntry::new("poison", json!({}), f.clock.utc_now())).await.unwrap();

        let report = f.relay.run_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(f.dlq_store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_entry_blocks_its_partition_but_not_others() {
        let f = fixture(quick_config(5, 1), BreakerConfig::new(100, 1, Duration::from_secs(1)));
        let a1 = f.store.enqueue(OutboxEntry::new("t", json!(1), f.clock.utc_now()).with_partition_key("site-a")).await.unwrap();
        let a2 = f.store.enqueue(OutboxEntry::new("t", json!(2), f.clock.utc_now()).with_partition_key("site-a")).await.unwrap();
        let b1 = f.store.enqueue(OutboxEntry::new("t", json!(3), f.clock.utc_now()).with_partition_key("site-b")).await.unwrap();

        f.broker.fail_next_publishes(1);
        let report = f.relay.run_once().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.deferred, 2);

        let ids: Vec<_> = f.broker.published().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![b1]);

        f.relay.run_once().await.unwrap();
        let ids: Vec<_> = f.broker.published().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec![b1, a1, a2]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_broker_circuit_defers_without_spending_budget() {
        let f = fixture(quick_config(5, 3), BreakerConfig::default());
        let id = f.store.enqueue(OutboxEntry::new("t", json!(1), f.clock.utc_now())).await.unwrap();
        f.store.enqueue(OutboxEntry::new("t", json!(2), f.clock.utc_now())).await.unwrap();
        f.caller.breakers().get("message-broker").force_open();

        let report = f.relay.run_once().await.unwrap();
        assert_eq!(report.deferred, 2);
        assert!(f.broker.published().is_empty());
        assert_eq!(f.store.get(id).await.unwrap().unwrap().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_relay_drains_and_shuts_down() {
        let f = fixture(OutboxConfig::default(), BreakerConfig::default());
        let handle = f.relay.clone().spawn(CancellationToken::new());

        f.store.enqueue(OutboxEntry::new("t", json!(1), f.clock.utc_now())).await.unwrap();
        handle.wake();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.broker.published().len(), 1);
        assert_eq!(handle.stats().dispatched, 1);
        handle.shutdown().await;
    }
}
