use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fluxora_core::{ResilienceError, ResilienceResult};
use fluxora_events::{Message, MessageBroker, Subscription};

use crate::dlq::{DeadLetterEntry, DeadLetterOrigin, DeadLetterQueue, REPLAY_HEADER};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Application logic for one topic. Must be idempotent: delivery is
/// at-least-once and replays from the dead-letter queue reuse the message id.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> ResilienceResult<()>;
}

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle(&self, message: &Message) -> ResilienceResult<()> {
        (**self).handle(message).await
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: String,
    pub topic: String,
    pub retry: RetryPolicy,
}

impl ConsumerConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            name: format!("consumer:{topic}"),
            topic,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What happened to one delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Handled { attempts: u32 },
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub received: u64,
    pub handled: u64,
    pub dead_lettered: u64,
    pub replays: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

/// Consumes one topic, retrying each message under the configured policy and
/// parking messages that exhaust it in the dead-letter queue.
pub struct ConsumerWorker {
    broker: Arc<dyn MessageBroker>,
    dlq: DeadLetterQueue,
    retry: RetryExecutor,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
}

impl std::fmt::Debug for ConsumerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConsumerWorker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        dlq: DeadLetterQueue,
        retry: RetryExecutor,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            dlq,
            retry,
            handler,
            config,
        }
    }

    /// Run one message through the handler. Exhausted or poison messages are
    /// parked; `Cancelled` leaves the message unhandled and unparked.
    pub async fn process(&self, message: &Message, cancel: &CancellationToken) -> ResilienceResult<MessageOutcome> {
        let received_at = self.dlq.clock().utc_now();
        if let Some(replay) = message.header(REPLAY_HEADER) {
            debug!(worker = %self.config.name, message_id = %message.id(), replay, "processing replayed message");
        }

        let mut attempts = 0u32;
        let handler = &self.handler;
        let result = self
            .retry
            .execute(&self.config.name, &self.config.retry, cancel, |attempt| {
                attempts = attempt;
                async move { handler.handle(message).await }
            })
            .await;

        let err = match result {
            Ok(()) => return Ok(MessageOutcome::Handled { attempts }),
            Err(ResilienceError::Cancelled) => return Err(ResilienceError::Cancelled),
            Err(err) => err,
        };

        let cause = err.root_cause();
        let entry = DeadLetterEntry::from_message(message, DeadLetterOrigin::Consumer, self.dlq.clock().utc_now())
            .with_failure(cause.to_string(), attempts)
            .first_seen(received_at);
        self.dlq.park(entry).await?;
        Ok(MessageOutcome::DeadLettered { attempts })
    }

    /// Subscribe, then consume on a background task until cancelled or the
    /// subscription closes.
    pub async fn spawn(self, cancel: CancellationToken) -> ResilienceResult<WorkerHandle> {
        let subscription = self
            .broker
            .subscribe(&self.config.topic)
            .await
            .map_err(ResilienceError::from)?;
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let join = {
            let cancel = cancel.clone();
            let stats = stats.clone();
            tokio::spawn(async move { self.worker_loop(subscription, cancel, stats).await })
        };

        Ok(WorkerHandle { cancel, join, stats })
    }

    async fn worker_loop(&self, mut subscription: Subscription, cancel: CancellationToken, stats: Arc<Mutex<WorkerStats>>) {
        info!(worker = %self.config.name, topic = %self.config.topic, "consumer started");

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscription.recv() => match next {
                    Some(message) => message,
                    None => {
                        info!(worker = %self.config.name, "subscription closed");
                        break;
                    }
                },
            };

            let outcome = self.process(&message, &cancel).await;
            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.received += 1;
            if message.header(REPLAY_HEADER).is_some() {
                s.replays += 1;
            }
            match outcome {
                Ok(MessageOutcome::Handled { .. }) => s.handled += 1,
                Ok(MessageOutcome::DeadLettered { .. }) => s.dead_lettered += 1,
                Err(ResilienceError::Cancelled) => {
                    info!(worker = %self.config.name, message_id = %message.id(), "shutdown during processing; message left unhandled");
                    break;
                }
                Err(err) => {
                    error!(worker = %self.config.name, message_id = %message.id(), error = %err, "message could not be handled or parked");
                    s.errors += 1;
                    s.last_error = Some(err.to_string());
                }
            }
        }

        info!(worker = %self.config.name, "consumer stopped");
    }
}

/// Handle to control a running consumer.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "consumer task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::dlq::{DeadLetterFilter, InMemoryDeadLetterStore};
    use fluxora_core::ManualClock;
    use fluxora_events::InMemoryBroker;
    use fluxora_observability::{InMemoryMetricsSink, NoopMetricsSink};
    use serde_json::json;

    /// Fails the first `failures` deliveries, then succeeds.
    struct Flaky {
        failures: AtomicU32,
        calls: AtomicU32,
        poison: bool,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                poison: false,
            })
        }
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        async fn handle(&self, _message: &Message) -> ResilienceResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.poison {
                return Err(ResilienceError::non_retryable("malformed payload"));
            }
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ResilienceError::retryable("downstream 503"));
            }
            Ok(())
        }
    }

    fn worker(handler: Arc<dyn MessageHandler>, broker: Arc<InMemoryBroker>, max_attempts: u32) -> (ConsumerWorker, DeadLetterQueue) {
        let dlq = DeadLetterQueue::new(
            InMemoryDeadLetterStore::arc(),
            broker.clone(),
            ManualClock::new().shared(),
            InMemoryMetricsSink::shared(),
        );
        let worker = ConsumerWorker::new(
            broker,
            dlq.clone(),
            RetryExecutor::new(NoopMetricsSink::shared()),
            handler,
            ConsumerConfig::new("forecasts").with_retry(RetryPolicy::fixed(max_attempts, Duration::from_millis(10))),
        );
        (worker, dlq)
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let handler = Flaky::new(2);
        let (worker, dlq) = worker(handler.clone(), Arc::new(InMemoryBroker::new()), 3);

        let outcome = worker
            .process(&Message::new("forecasts", json!({})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, MessageOutcome::Handled { attempts: 3 });
        assert!(dlq.list(&DeadLetterFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_message_is_parked_once_with_max_attempts() {
        let handler = Flaky::new(u32::MAX);
        let (worker, dlq) = worker(handler.clone(), Arc::new(InMemoryBroker::new()), 4);
        let message = Message::new("forecasts", json!({"site": 9})).with_partition_key("site-9");

        let outcome = worker.process(&message, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, MessageOutcome::DeadLettered { attempts: 4 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);

        let parked = dlq.list(&DeadLetterFilter::all()).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].id, message.id());
        assert_eq!(parked[0].attempts, 4);
        assert_eq!(parked[0].origin, DeadLetterOrigin::Consumer);
        assert_eq!(parked[0].partition_key.as_deref(), Some("site-9"));
        assert!(parked[0].error.contains("downstream 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn poison_messages_skip_retries() {
        let handler = Arc::new(Flaky {
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            poison: true,
        });
        let (worker, _dlq) = worker(handler.clone(), Arc::new(InMemoryBroker::new()), 5);

        let outcome = worker
            .process(&Message::new("forecasts", json!(null)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, MessageOutcome::DeadLettered { attempts: 1 });
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_processing_parks_nothing() {
        let handler = Flaky::new(u32::MAX);
        let (worker, dlq) = worker(handler, Arc::new(InMemoryBroker::new()), 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = worker
            .process(&Message::new("forecasts", json!({})), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ResilienceError::Cancelled);
        assert!(dlq.list(&DeadLetterFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_worker_consumes_until_shutdown() {
        let broker = Arc::new(InMemoryBroker::new());
        let handler = Flaky::new(0);
        let (worker, _dlq) = worker(handler.clone(), broker.clone(), 3);

        let handle = worker.spawn(CancellationToken::new()).await.unwrap();
        for n in 0..3 {
            broker.publish(Message::new("forecasts", json!(n))).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let stats = handle.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.handled, 3);
        handle.shutdown().await;
    }
}
