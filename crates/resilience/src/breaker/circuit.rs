use std::future::Future;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info, warn};

use fluxora_core::{ResilienceError, ResilienceResult, SharedClock};
use fluxora_observability::{ResilienceEvent, SharedMetricsSink};

use crate::fallback::Fallback;

use super::state::{BreakerConfig, CircuitMode, CircuitSnapshot, FailureClassifier};

#[derive(Debug)]
struct CircuitState {
    mode: CircuitMode,
    consecutive_failures: u32,
    consecutive_successes: u32,
    trials_in_flight: u32,
    opened_at: Option<Instant>,
    last_transition: Instant,
    /// Bumped on every transition; permits from older generations are ignored.
    generation: u64,
}

impl CircuitState {
    fn closed(now: Instant) -> Self {
        Self {
            mode: CircuitMode::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            trials_in_flight: 0,
            opened_at: None,
            last_transition: now,
            generation: 0,
        }
    }

    fn transition(&mut self, mode: CircuitMode, now: Instant) {
        self.mode = mode;
        self.generation += 1;
        self.last_transition = now;
        self.consecutive_successes = 0;
        self.trials_in_flight = 0;
        match mode {
            CircuitMode::Open => self.opened_at = Some(now),
            CircuitMode::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
            }
            CircuitMode::HalfOpen => {}
        }
    }
}

/// Per-dependency circuit breaker.
///
/// All transitions happen under one lock. Half-open trial slots are claimed
/// under the same lock, so exactly `half_open_max_trials` callers are admitted.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    classifier: FailureClassifier,
    clock: SharedClock,
    metrics: SharedMetricsSink,
    state: Mutex<CircuitState>,
}

/// Admission ticket for one call.
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). A permit dropped without a report
/// (the caller's future was cancelled) frees its trial slot and changes
/// nothing else.
#[derive(Debug)]
#[must_use = "report the call outcome through the permit"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    reported: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.generation, self.trial);
    }

    /// Report a failure; the breaker's classifier decides whether it counts.
    pub fn record_failure(mut self, err: &ResilienceError) {
        self.reported = true;
        let counted = self.breaker.classifier.counts(err);
        self.breaker.on_failure(self.generation, self.trial, counted);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.trial {
            self.breaker.release_trial(self.generation);
        }
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        classifier: FailureClassifier,
        clock: SharedClock,
        metrics: SharedMetricsSink,
    ) -> Self {
        let now = clock.now();
        Self {
            name: name.into(),
            config,
            classifier,
            clock,
            metrics,
            state: Mutex::new(CircuitState::closed(now)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        // Every critical section leaves the state machine in a valid mode.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: Option<ResilienceEvent>) {
        if let Some(event) = event {
            self.metrics.record(event);
        }
    }

    /// Current mode, applying the Open → HalfOpen timer if it has elapsed.
    pub fn mode(&self) -> CircuitMode {
        let (mode, event) = {
            let mut state = self.lock();
            let event = self.maybe_half_open(&mut state);
            (state.mode, event)
        };
        self.emit(event);
        mode
    }

    fn maybe_half_open(&self, state: &mut CircuitState) -> Option<ResilienceEvent> {
        if state.mode != CircuitMode::Open {
            return None;
        }
        let now = self.clock.now();
        let opened_at = state.opened_at.unwrap_or(state.last_transition);
        if now.duration_since(opened_at) < self.config.open_duration {
            return None;
        }
        state.transition(CircuitMode::HalfOpen, now);
        info!(dependency = %self.name, "circuit half-open; admitting trial calls");
        Some(ResilienceEvent::CircuitHalfOpened {
            dependency: self.name.clone(),
        })
    }

    /// Ask for admission. Fails fast with `CircuitOpen` when the call must not run.
    pub fn try_acquire(&self) -> ResilienceResult<CallPermit<'_>> {
        let (admitted, event) = {
            let mut state = self.lock();
            let event = self.maybe_half_open(&mut state);
            let admitted = match state.mode {
                CircuitMode::Closed => Some((state.generation, false)),
                CircuitMode::HalfOpen if state.trials_in_flight < self.config.half_open_max_trials => {
                    state.trials_in_flight += 1;
                    Some((state.generation, true))
                }
                CircuitMode::HalfOpen | CircuitMode::Open => None,
            };
            (admitted, event)
        };
        self.emit(event);

        match admitted {
            Some((generation, trial)) => {
                if trial {
                    debug!(dependency = %self.name, "admitted half-open trial call");
                }
                Ok(CallPermit {
                    breaker: self,
                    generation,
                    trial,
                    reported: false,
                })
            }
            None => {
                debug!(dependency = %self.name, "call rejected by open circuit");
                self.metrics.record(ResilienceEvent::CallRejected {
                    dependency: self.name.clone(),
                });
                Err(ResilienceError::CircuitOpen {
                    dependency: self.name.clone(),
                })
            }
        }
    }

    fn on_success(&self, generation: u64, trial: bool) {
        let event = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            match state.mode {
                CircuitMode::Closed => {
                    state.consecutive_failures = 0;
                    None
                }
                CircuitMode::HalfOpen => {
                    if trial {
                        state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
                    }
                    state.consecutive_successes += 1;
                    if state.consecutive_successes >= self.config.success_threshold {
                        state.transition(CircuitMode::Closed, self.clock.now());
                        info!(dependency = %self.name, "circuit closed");
                        Some(ResilienceEvent::CircuitClosed {
                            dependency: self.name.clone(),
                        })
                    } else {
                        None
                    }
                }
                CircuitMode::Open => None,
            }
        };
        self.emit(event);
    }

    fn on_failure(&self, generation: u64, trial: bool, counted: bool) {
        let event = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            if trial {
                state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
            }
            if !counted {
                return;
            }
            match state.mode {
                CircuitMode::Closed => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= self.config.failure_threshold {
                        let failures = state.consecutive_failures;
                        state.transition(CircuitMode::Open, self.clock.now());
                        Some(failures)
                    } else {
                        None
                    }
                }
                CircuitMode::HalfOpen => {
                    state.consecutive_failures += 1;
                    let failures = state.consecutive_failures;
                    state.transition(CircuitMode::Open, self.clock.now());
                    Some(failures)
                }
                CircuitMode::Open => None,
            }
        };

        if let Some(consecutive_failures) = event {
            warn!(
                dependency = %self.name,
                consecutive_failures,
                open_ms = self.config.open_duration.as_millis() as u64,
                "circuit opened"
            );
            self.metrics.record(ResilienceEvent::CircuitOpened {
                dependency: self.name.clone(),
                consecutive_failures,
            });
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation && state.mode == CircuitMode::HalfOpen {
            state.trials_in_flight = state.trials_in_flight.saturating_sub(1);
        }
    }

    /// Run `op` through the breaker and report its outcome.
    pub async fn execute<T, F, Fut>(&self, op: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let permit = self.try_acquire()?;
        let result = op().await;
        match &result {
            Ok(_) => permit.record_success(),
            Err(err) => permit.record_failure(err),
        }
        result
    }

    /// Like [`execute`](Self::execute), but answers from `fallback` when the
    /// circuit rejects the call or the call fails.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        op: F,
        fallback: &dyn Fallback<T>,
    ) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        match self.execute(op).await {
            Ok(value) => Ok(value),
            Err(err) => match fallback.recover(&err) {
                Some(value) => {
                    debug!(dependency = %self.name, error = %err, "served fallback");
                    Ok(value)
                }
                None => Err(err),
            },
        }
    }

    pub fn state(&self) -> CircuitSnapshot {
        let (snapshot, event) = {
            let mut state = self.lock();
            let event = self.maybe_half_open(&mut state);
            let snapshot = CircuitSnapshot {
                name: self.name.clone(),
                mode: state.mode,
                consecutive_failures: state.consecutive_failures,
                consecutive_successes: state.consecutive_successes,
                trials_in_flight: state.trials_in_flight,
                seconds_since_transition: self
                    .clock
                    .now()
                    .duration_since(state.last_transition)
                    .as_secs_f64(),
            };
            (snapshot, event)
        };
        self.emit(event);
        snapshot
    }

    /// Operator action: close the circuit and clear all counters.
    pub fn reset(&self) {
        let was = {
            let mut state = self.lock();
            let was = state.mode;
            state.transition(CircuitMode::Closed, self.clock.now());
            was
        };
        info!(dependency = %self.name, from = %was, "circuit reset by operator");
        if was != CircuitMode::Closed {
            self.metrics.record(ResilienceEvent::CircuitClosed {
                dependency: self.name.clone(),
            });
        }
    }

    /// Operator action: open the circuit now, starting a fresh open timer.
    pub fn force_open(&self) {
        let failures = {
            let mut state = self.lock();
            state.transition(CircuitMode::Open, self.clock.now());
            state.consecutive_failures
        };
        warn!(dependency = %self.name, "circuit forced open by operator");
        self.metrics.record(ResilienceEvent::CircuitOpened {
            dependency: self.name.clone(),
            consecutive_failures: failures,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::fallback::DefaultValueFallback;
    use fluxora_core::ManualClock;
    use fluxora_observability::InMemoryMetricsSink;

    fn breaker(config: BreakerConfig) -> (CircuitBreaker, ManualClock, Arc<InMemoryMetricsSink>) {
        let clock = ManualClock::new();
        let metrics = InMemoryMetricsSink::shared();
        let cb = CircuitBreaker::new(
            "forecast-api",
            config,
            FailureClassifier::default(),
            clock.shared(),
            metrics.clone(),
        );
        (cb, clock, metrics)
    }

    async fn fail(cb: &CircuitBreaker) -> ResilienceResult<()> {
        cb.execute(|| async { Err::<(), _>(ResilienceError::retryable("503")) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> ResilienceResult<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast_without_running() {
        let (cb, _clock, metrics) = breaker(BreakerConfig::new(3, 2, Duration::from_secs(10)));
        for _ in 0..3 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.mode(), CircuitMode::Open);

        let calls = AtomicU32::new(0);
        let err = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.count("circuit_opened_total"), 1);
        assert_eq!(metrics.count("circuit_rejected_calls_total"), 1);
    }

    #[tokio::test]
    async fn client_errors_are_neutral() {
        let (cb, _clock, _) = breaker(BreakerConfig::new(2, 1, Duration::from_secs(10)));
        for _ in 0..5 {
            let _ = cb
                .execute(|| async { Err::<(), _>(ResilienceError::non_retryable("404")) })
                .await;
        }
        assert_eq!(cb.mode(), CircuitMode::Closed);
        assert_eq!(cb.state().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn success_resets_the_consecutive_count() {
        let (cb, _clock, _) = breaker(BreakerConfig::new(3, 1, Duration::from_secs(10)));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.mode(), CircuitMode::Closed);
    }

    #[tokio::test]
    async fn open_half_open_close_and_reopen_timeline() {
        let (cb, clock, metrics) = breaker(BreakerConfig::new(3, 2, Duration::from_secs(10)));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.mode(), CircuitMode::Open);

        clock.advance(Duration::from_secs(9));
        assert!(matches!(
            succeed(&cb).await,
            Err(ResilienceError::CircuitOpen { .. })
        ));

        // t = 11s: the next caller is the trial.
        clock.advance(Duration::from_secs(2));
        let permit = cb.try_acquire().unwrap();
        assert!(permit.is_trial());
        assert!(matches!(
            cb.try_acquire(),
            Err(ResilienceError::CircuitOpen { .. })
        ));
        permit.record_success();
        assert_eq!(cb.mode(), CircuitMode::HalfOpen);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.mode(), CircuitMode::Closed);
        assert_eq!(metrics.count("circuit_closed_total"), 1);

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        clock.advance(Duration::from_secs(10));
        let _ = fail(&cb).await;
        assert_eq!(cb.mode(), CircuitMode::Open);

        // Fresh 10s timer from the failed trial.
        clock.advance(Duration::from_secs(9));
        assert_eq!(cb.mode(), CircuitMode::Open);
        clock.advance(Duration::from_secs(1));
        assert_eq!(cb.mode(), CircuitMode::HalfOpen);
    }

    #[tokio::test]
    async fn dropped_trial_permit_frees_the_slot() {
        let (cb, clock, _) = breaker(BreakerConfig::new(1, 1, Duration::from_secs(5)));
        let _ = fail(&cb).await;
        clock.advance(Duration::from_secs(5));

        let permit = cb.try_acquire().unwrap();
        drop(permit);
        let permit = cb.try_acquire().unwrap();
        assert!(permit.is_trial());
        permit.record_success();
        assert_eq!(cb.mode(), CircuitMode::Closed);
    }

    #[tokio::test]
    async fn stale_permits_are_ignored_after_a_transition() {
        let (cb, _clock, _) = breaker(BreakerConfig::new(1, 1, Duration::from_secs(5)));
        let slow = cb.try_acquire().unwrap();
        let _ = fail(&cb).await;
        assert_eq!(cb.mode(), CircuitMode::Open);

        // Success reported by a call admitted before the circuit opened.
        slow.record_success();
        assert_eq!(cb.mode(), CircuitMode::Open);
    }

    #[tokio::test]
    async fn fallback_answers_when_the_circuit_is_open() {
        let (cb, _clock, _) = breaker(BreakerConfig::new(1, 1, Duration::from_secs(5)));
        let _ = fail(&cb).await;

        let value = cb
            .execute_with_fallback(|| async { Ok(1) }, &DefaultValueFallback::new(0))
            .await
            .unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn operator_reset_and_force_open() {
        let (cb, _clock, _) = breaker(BreakerConfig::new(1, 1, Duration::from_secs(60)));
        cb.force_open();
        assert_eq!(cb.mode(), CircuitMode::Open);
        cb.reset();
        assert_eq!(cb.mode(), CircuitMode::Closed);
        succeed(&cb).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_callers_get_exactly_one_trial() {
        let (cb, clock, _) = breaker(BreakerConfig::new(1, 1, Duration::from_secs(1)));
        let cb = Arc::new(cb);
        let _ = fail(&cb).await;
        clock.advance(Duration::from_secs(1));

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let admitted = Arc::new(AtomicU32::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cb = cb.clone();
            let barrier = barrier.clone();
            let admitted = admitted.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                if let Ok(permit) = cb.try_acquire() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                    // Hold the slot until everyone has tried.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    drop(permit);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }
}
