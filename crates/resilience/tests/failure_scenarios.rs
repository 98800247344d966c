//! Black-box failure scenarios against the public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use fluxora_core::{ManualClock, ResilienceError, ResilienceResult, TransactionId};
use fluxora_events::{InMemoryBroker, Message, MessageBroker};
use fluxora_observability::{InMemoryMetricsSink, NoopMetricsSink};
use fluxora_resilience::breaker::{BreakerConfig, CircuitBreaker, CircuitMode, FailureClassifier};
use fluxora_resilience::dlq::{DeadLetterFilter, DeadLetterQueue, InMemoryDeadLetterStore};
use fluxora_resilience::outbox::{InMemoryOutboxStore, OutboxEntry, OutboxStore};
use fluxora_resilience::resource::{PoolsConfig, ResourceManager};
use fluxora_resilience::retry::{RetryExecutor, RetryPolicy};
use fluxora_resilience::saga::{
    InMemorySagaLog, SagaConfig, SagaContext, SagaCoordinator, SagaDefinition, SagaStart, SagaStatus,
    SagaStep, StepOutcome,
};
use fluxora_resilience::workers::{ConsumerConfig, ConsumerWorker, MessageHandler, MessageOutcome};

fn breaker(clock: &ManualClock, failure_threshold: u32, success_threshold: u32, open: Duration) -> CircuitBreaker {
    CircuitBreaker::new(
        "pricing-api",
        BreakerConfig::new(failure_threshold, success_threshold, open),
        FailureClassifier::default(),
        clock.shared(),
        NoopMetricsSink::shared(),
    )
}

async fn fail(breaker: &CircuitBreaker) -> ResilienceResult<()> {
    breaker
        .execute(|| async { Err::<(), _>(ResilienceError::retryable("503")) })
        .await
}

async fn succeed(breaker: &CircuitBreaker) -> ResilienceResult<()> {
    breaker.execute(|| async { Ok(()) }).await
}

#[tokio::test]
async fn open_circuit_rejects_without_invoking_the_operation() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 3, 1, Duration::from_secs(10));
    for _ in 0..3 {
        assert!(fail(&breaker).await.is_err());
    }
    assert_eq!(breaker.mode(), CircuitMode::Open);

    let invoked = AtomicU32::new(0);
    let result = breaker
        .execute(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn half_open_admits_exactly_one_concurrent_trial() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 1, 1, Duration::from_secs(5));
    let _ = fail(&breaker).await;
    clock.advance(Duration::from_secs(5));

    let trial = breaker.try_acquire().unwrap();
    assert!(trial.is_trial());
    assert!(matches!(breaker.try_acquire(), Err(ResilienceError::CircuitOpen { .. })));

    trial.record_success();
    assert_eq!(breaker.mode(), CircuitMode::Closed);
}

#[tokio::test]
async fn threshold_three_open_ten_seconds_success_threshold_two() {
    let clock = ManualClock::new();
    let breaker = breaker(&clock, 3, 2, Duration::from_secs(10));

    for _ in 0..3 {
        let _ = fail(&breaker).await;
    }
    assert_eq!(breaker.mode(), CircuitMode::Open);

    clock.advance(Duration::from_secs(11));
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.mode(), CircuitMode::HalfOpen);
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.mode(), CircuitMode::Closed);

    // Open again, then fail the trial: fresh 10s timer from the failure.
    for _ in 0..3 {
        let _ = fail(&breaker).await;
    }
    clock.advance(Duration::from_secs(11));
    assert!(fail(&breaker).await.is_err());
    assert_eq!(breaker.mode(), CircuitMode::Open);

    clock.advance(Duration::from_secs(9));
    assert_eq!(breaker.mode(), CircuitMode::Open);
    clock.advance(Duration::from_secs(1));
    assert_eq!(breaker.mode(), CircuitMode::HalfOpen);
}

#[test]
fn delay_curve_is_monotonic_and_jitter_is_bounded() {
    let policy = RetryPolicy::exponential(10, Duration::from_millis(50), Duration::from_secs(2)).with_jitter(0.3);
    let mut previous = Duration::ZERO;
    for attempt in 1..10 {
        let delay = policy.base_delay_for_attempt(attempt);
        assert!(delay >= previous);
        assert!(delay <= Duration::from_secs(2));
        previous = delay;
    }

    let mut rng = rand::thread_rng();
    for attempt in 1..10 {
        let delay = policy.delay_for_attempt(attempt, &mut rng);
        assert!(delay <= Duration::from_secs(2).mul_f64(1.3));
    }
}

type Journal = Arc<Mutex<Vec<String>>>;

struct Step {
    name: String,
    journal: Journal,
    fail_forward: bool,
    compensation_failures: Arc<AtomicU32>,
}

impl Step {
    fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            fail_forward: false,
            compensation_failures: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl SagaStep for Step {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self, _ctx: &mut SagaContext) -> ResilienceResult<()> {
        self.journal.lock().unwrap().push(format!("forward:{}", self.name));
        if self.fail_forward {
            return Err(ResilienceError::non_retryable("declined"));
        }
        Ok(())
    }

    async fn compensate(&self, _ctx: &SagaContext) -> ResilienceResult<()> {
        if self.compensation_failures.load(Ordering::SeqCst) > 0 {
            self.compensation_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ResilienceError::non_retryable("refund rejected"));
        }
        self.journal.lock().unwrap().push(format!("compensate:{}", self.name));
        Ok(())
    }
}

fn coordinator() -> SagaCoordinator {
    SagaCoordinator::new(
        InMemorySagaLog::arc(),
        RetryExecutor::new(NoopMetricsSink::shared()),
        SagaConfig {
            step_retry: RetryPolicy::no_retry(),
            compensation_retry: RetryPolicy::no_retry(),
        },
        ManualClock::new().shared(),
        InMemoryMetricsSink::shared(),
    )
}

#[tokio::test]
async fn failing_third_step_compensates_two_then_one() {
    let journal: Journal = Arc::default();
    let sagas = coordinator();
    let mut definition = SagaDefinition::new("five");
    for i in 1..=5 {
        let mut step = Step::new(&format!("s{i}"), &journal);
        step.fail_forward = i == 3;
        definition = definition.step(step);
    }
    sagas.register(definition).unwrap();

    let id = TransactionId::new();
    let err = sagas
        .start("five", SagaStart::new().with_transaction_id(id))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::SagaStepFailed { .. }));

    assert_eq!(
        *journal.lock().unwrap(),
        vec!["forward:s1", "forward:s2", "forward:s3", "compensate:s2", "compensate:s1"]
    );
    let execution = sagas.get_status(id).await.unwrap();
    assert_eq!(execution.status, SagaStatus::Aborted);
}

#[tokio::test]
async fn resume_never_repeats_finished_compensations() {
    let journal: Journal = Arc::default();
    let sagas = coordinator();
    let stubborn = Arc::new(AtomicU32::new(1));
    let mut first = Step::new("first", &journal);
    first.compensation_failures = stubborn.clone();
    let mut third = Step::new("third", &journal);
    third.fail_forward = true;
    sagas
        .register(
            SagaDefinition::new("halting")
                .step(first)
                .step(Step::new("second", &journal))
                .step(third),
        )
        .unwrap();

    let id = TransactionId::new();
    let err = sagas
        .start("halting", SagaStart::new().with_transaction_id(id))
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::CompensationFailed { .. }));

    let halted = sagas.get_status(id).await.unwrap();
    assert_eq!(halted.status, SagaStatus::Compensating);
    assert_eq!(halted.steps[1].outcome, StepOutcome::Compensated);

    let _ = sagas.resume(id, &CancellationToken::new()).await;

    let compensations: Vec<String> = journal
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.starts_with("compensate:"))
        .cloned()
        .collect();
    assert_eq!(compensations, vec!["compensate:second", "compensate:first"]);
    assert_eq!(sagas.get_status(id).await.unwrap().status, SagaStatus::Aborted);
}

#[tokio::test]
async fn rolled_back_outbox_write_is_invisible() {
    let store = InMemoryOutboxStore::arc();
    let mut tx = store.begin();
    tx.enqueue(OutboxEntry::new("orders", json!({"id": 1}), chrono::Utc::now()));
    tx.rollback();

    {
        // Dropped without commit.
        let mut tx = store.begin();
        tx.enqueue(OutboxEntry::new("orders", json!({"id": 2}), chrono::Utc::now()));
    }

    assert!(store.fetch_pending(10).await.unwrap().is_empty());
}

struct AlwaysDown(AtomicU32);

#[async_trait]
impl MessageHandler for AlwaysDown {
    async fn handle(&self, _message: &Message) -> ResilienceResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(ResilienceError::retryable("ledger unavailable"))
    }
}

#[tokio::test(start_paused = true)]
async fn exhausted_message_is_parked_once_and_replay_removes_it() {
    let broker = Arc::new(InMemoryBroker::new());
    let dlq = DeadLetterQueue::new(
        InMemoryDeadLetterStore::arc(),
        broker.clone(),
        ManualClock::new().shared(),
        NoopMetricsSink::shared(),
    );
    let handler = Arc::new(AlwaysDown(AtomicU32::new(0)));
    let worker = ConsumerWorker::new(
        broker.clone(),
        dlq.clone(),
        RetryExecutor::new(NoopMetricsSink::shared()),
        handler.clone(),
        ConsumerConfig::new("ledger").with_retry(RetryPolicy::fixed(3, Duration::from_millis(20))),
    );

    let message = Message::new("ledger", json!({"amount": 10}));
    let outcome = worker.process(&message, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, MessageOutcome::DeadLettered { attempts: 3 });
    // Redelivery of the same message does not duplicate the entry.
    worker.process(&message, &CancellationToken::new()).await.unwrap();

    let parked = dlq.list(&DeadLetterFilter::all()).await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].attempts, 3);

    broker.set_available(false);
    assert!(dlq.replay(message.id()).await.is_err());
    assert_eq!(dlq.get(message.id()).await.unwrap().replay_attempts, 1);

    broker.set_available(true);
    let mut subscription = broker.subscribe("ledger").await.unwrap();
    dlq.replay(message.id()).await.unwrap();
    assert!(matches!(dlq.get(message.id()).await, Err(ResilienceError::NotFound(_))));
    assert_eq!(subscription.recv().await.unwrap().id(), message.id());
}

#[tokio::test(start_paused = true)]
async fn one_extra_acquire_waits_for_a_release() {
    let manager = Arc::new(ResourceManager::new(
        PoolsConfig::default().with_pool("db", 2),
        ManualClock::new().shared(),
        NoopMetricsSink::shared(),
    ));
    let first = manager.acquire("db", Duration::from_secs(1)).await.unwrap();
    let _second = manager.acquire("db", Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire("db", Duration::from_secs(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    drop(first);
    let third = waiter.await.unwrap().unwrap();
    assert_eq!(third.pool(), "db");
    assert_eq!(manager.pool_stats("db").in_use, 2);

    let timed_out = manager.acquire("db", Duration::from_millis(200)).await;
    assert!(matches!(timed_out, Err(ResilienceError::ResourceExhausted { .. })));
}
