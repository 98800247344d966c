use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;

use fluxora_core::{ResilienceError, ResilienceResult, TransactionId};

use crate::retry::RetryPolicy;

/// Working state handed to each step.
///
/// `data` is persisted with every committed step, so a resumed execution
/// sees what earlier steps wrote.
#[derive(Debug, Clone)]
pub struct SagaContext {
    transaction_id: TransactionId,
    pub data: Map<String, JsonValue>,
    cancel: CancellationToken,
}

impl SagaContext {
    pub fn new(transaction_id: TransactionId, data: Map<String, JsonValue>, cancel: CancellationToken) -> Self {
        Self {
            transaction_id,
            data,
            cancel,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Typed read of a value written by an earlier step.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> ResilienceResult<Option<T>> {
        self.data
            .get(key)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| ResilienceError::non_retryable(format!("saga data `{key}`: {e}")))
            })
            .transpose()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Serialize) -> ResilienceResult<()> {
        let value = serde_json::to_value(value)
            .map_err(|e| ResilienceError::non_retryable(format!("saga data: {e}")))?;
        self.data.insert(key.into(), value);
        Ok(())
    }
}

/// One business action of a saga.
///
/// Forward actions and compensations should be idempotent: a crash between
/// running an action and logging its outcome re-runs it on resume.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Human-readable name for logs and audit.
    fn name(&self) -> &str;

    async fn forward(&self, ctx: &mut SagaContext) -> ResilienceResult<()>;

    async fn compensate(&self, _ctx: &SagaContext) -> ResilienceResult<()> {
        Ok(())
    }

    /// Steps without side effects to undo return `false`; they are marked
    /// compensated without being called.
    fn has_compensation(&self) -> bool {
        true
    }
}

/// Ordered steps plus optional retry overrides.
#[derive(Clone)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
    pub(crate) step_retry: Option<RetryPolicy>,
    pub(crate) compensation_retry: Option<RetryPolicy>,
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish_non_exhaustive()
    }
}

impl SagaDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            step_retry: None,
            compensation_retry: None,
        }
    }

    pub fn step(mut self, step: impl SagaStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_step_retry(mut self, policy: RetryPolicy) -> Self {
        self.step_retry = Some(policy);
        self
    }

    pub fn with_compensation_retry(mut self, policy: RetryPolicy) -> Self {
        self.compensation_retry = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.steps.is_empty() {
            return Err(ResilienceError::config(format!("saga `{}` has no steps", self.name)));
        }
        if let Some(policy) = &self.step_retry {
            policy.validate()?;
        }
        if let Some(policy) = &self.compensation_retry {
            policy.validate()?;
        }
        Ok(())
    }
}
