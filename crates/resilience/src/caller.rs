//! Composition of the three call guards.
//!
//! Retry wraps Breaker wraps the pool-gated call: an open circuit ends the
//! retry loop immediately, and every attempt acquires a fresh lease that is
//! released before the backoff sleep.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fluxora_core::{ResilienceError, ResilienceResult};

use crate::breaker::CircuitBreakerRegistry;
use crate::resource::ResourceManager;
use crate::retry::{RetryExecutor, RetryPolicy};

/// Where a call goes and how it is gated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    /// Breaker name.
    pub dependency: String,
    /// Resource pool; defaults to the dependency name.
    pub pool: String,
    /// Falls back to the resource manager's default when `None`.
    pub acquire_timeout: Option<Duration>,
    /// Per-attempt deadline; an overrun counts as `Timeout`.
    pub call_timeout: Option<Duration>,
}

impl CallSpec {
    pub fn new(dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        Self {
            pool: dependency.clone(),
            dependency,
            acquire_timeout: None,
            call_timeout: None,
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ResilientCaller {
    resources: Arc<ResourceManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
}

impl ResilientCaller {
    pub fn new(
        resources: Arc<ResourceManager>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            resources,
            breakers,
            retry,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Run `op` against `spec.dependency` under `policy`.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn call<T, F, Fut>(
        &self,
        spec: &CallSpec,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut op: F,
    ) -> ResilienceResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let breaker = self.breakers.get(&spec.dependency);
        let breaker = breaker.as_ref();
        let resources = self.resources.as_ref();
        let acquire_timeout = spec
            .acquire_timeout
            .unwrap_or_else(|| resources.default_acquire_timeout());

        self.retry
            .execute(&spec.dependency, policy, cancel, |attempt| {
                let fut = op(attempt);
                async move {
                    breaker
                        .execute(move || async move {
                            let mut lease = resources
                                .acquire_with_cancel(&spec.pool, acquire_timeout, cancel)
                                .await?;
                            let result = match spec.call_timeout {
                                Some(limit) => tokio::time::timeout(limit, fut)
                                    .await
                                    .unwrap_or(Err(ResilienceError::Timeout(limit))),
                                None => fut.await,
                            };
                            lease.release();
                            result
                        })
                        .await
                }
            })
            .await
    }
}
