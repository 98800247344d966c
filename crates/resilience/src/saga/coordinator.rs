use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fluxora_core::{ResilienceError, ResilienceResult, SharedClock, TransactionId};
use fluxora_observability::{ResilienceEvent, SharedMetricsSink};

use crate::retry::{RetryExecutor, RetryPolicy};

use super::execution::{SagaExecution, SagaStatus};
use super::log::{SagaLog, SagaLogEvent, SagaLogRecord};
use super::step::{SagaContext, SagaDefinition};

/// Default retry policies for saga steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    pub step_retry: RetryPolicy,
    /// Compensations get a larger budget; giving up halts the execution.
    pub compensation_retry: RetryPolicy,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            step_retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::exponential(5, Duration::from_millis(200), Duration::from_secs(5)),
        }
    }
}

impl SagaConfig {
    pub fn validate(&self) -> ResilienceResult<()> {
        self.step_retry.validate()?;
        self.compensation_retry.validate()
    }
}

/// Input for a new execution.
#[derive(Debug, Clone, Default)]
pub struct SagaStart {
    /// Caller-supplied id; generated when absent.
    pub transaction_id: Option<TransactionId>,
    pub data: Map<String, JsonValue>,
    pub cancel: CancellationToken,
}

impl SagaStart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transaction_id(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What `recover` did with each in-flight execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub completed: Vec<TransactionId>,
    pub aborted: Vec<TransactionId>,
    /// Waiting for an operator; left untouched or halted again.
    pub halted: Vec<TransactionId>,
    pub errors: Vec<(TransactionId, String)>,
}

/// Runs saga executions and owns them until they reach a terminal status.
pub struct SagaCoordinator {
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
    log: Arc<dyn SagaLog>,
    retry: RetryExecutor,
    config: SagaConfig,
    clock: SharedClock,
    metrics: SharedMetricsSink,
    active: Mutex<HashSet<TransactionId>>,
}

impl std::fmt::Debug for SagaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Single-writer claim on an execution id, released on drop.
struct ExecutionClaim<'a> {
    active: &'a Mutex<HashSet<TransactionId>>,
    id: TransactionId,
}

impl Drop for ExecutionClaim<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl SagaCoordinator {
    pub fn new(
        log: Arc<dyn SagaLog>,
        retry: RetryExecutor,
        config: SagaConfig,
        clock: SharedClock,
        metrics: SharedMetricsSink,
    ) -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            log,
            retry,
            config,
            clock,
            metrics,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Register (or replace) a definition under its name.
    pub fn register(&self, definition: SagaDefinition) -> ResilienceResult<()> {
        definition.validate()?;
        let name = definition.name().to_string();
        let steps = definition.steps().len();
        self.definitions
            .write()
            .map_err(|_| ResilienceError::storage("saga registry lock poisoned"))?
            .insert(name.clone(), Arc::new(definition));
        debug!(saga = %name, steps, "saga registered");
        Ok(())
    }

    fn definition(&self, name: &str) -> ResilienceResult<Arc<SagaDefinition>> {
        self.definitions
            .read()
            .map_err(|_| ResilienceError::storage("saga registry lock poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| ResilienceError::not_found(format!("saga definition `{name}`")))
    }

    fn claim(&self, id: TransactionId) -> ResilienceResult<ExecutionClaim<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(id) {
            return Err(ResilienceError::invalid_state(format!(
                "saga {id} is already being driven"
            )));
        }
        Ok(ExecutionClaim {
            active: &self.active,
            id,
        })
    }

    /// Run a new execution to a terminal (or halted) state.
    ///
    /// `Ok(id)` when completed, `SagaStepFailed` after a successful abort,
    /// `CompensationFailed` when a compensation gave up.
    pub async fn start(&self, saga: &str, start: SagaStart) -> ResilienceResult<TransactionId> {
        let definition = self.definition(saga)?;
        let id = start.transaction_id.unwrap_or_default();
        let _claim = self.claim(id)?;

        if !self.log.load(id).await?.is_empty() {
            return Err(ResilienceError::invalid_state(format!(
                "saga execution {id} already exists"
            )));
        }

        let started = SagaLogRecord {
            transaction_id: id,
            sequence: 1,
            recorded_at: self.clock.utc_now(),
            event: SagaLogEvent::Started {
                saga: definition.name().to_string(),
                steps: definition.step_names(),
                data: start.data,
            },
        };
        self.log.append(started.clone()).await?;
        let mut execution = SagaExecution::replay(std::slice::from_ref(&started))?;
        info!(saga = %definition.name(), transaction_id = %id, "saga started");

        self.drive(&definition, &mut execution, &start.cancel).await
    }

    /// `start` on a background task. The id is known before the task runs.
    pub fn submit(
        self: &Arc<Self>,
        saga: &str,
        mut start: SagaStart,
    ) -> ResilienceResult<(TransactionId, JoinHandle<ResilienceResult<TransactionId>>)> {
        self.definition(saga)?;
        let id = *start.transaction_id.get_or_insert_with(TransactionId::new);
        let coordinator = Arc::clone(self);
        let saga = saga.to_string();
        let handle = tokio::spawn(async move { coordinator.start(&saga, start).await });
        Ok((id, handle))
    }

    pub async fn get_status(&self, id: TransactionId) -> ResilienceResult<SagaExecution> {
        let records = self.log.load(id).await?;
        if records.is_empty() {
            return Err(ResilienceError::not_found(format!("saga execution {id}")));
        }
        SagaExecution::replay(&records)
    }

    /// Continue an execution from its log.
    ///
    /// Used after a crash and by operators to retry a halted compensation.
    /// Already committed or compensated steps are never re-run.
    pub async fn resume(&self, id: TransactionId, cancel: &CancellationToken) -> ResilienceResult<TransactionId> {
        let _claim = self.claim(id)?;
        let mut execution = self.get_status(id).await?;
        let definition = self.definition(&execution.saga)?;
        if definition.step_names().len() != execution.steps.len() {
            return Err(ResilienceError::invalid_state(format!(
                "saga {id} was started with {} steps, definition `{}` has {}",
                execution.steps.len(),
                definition.name(),
                definition.steps().len()
            )));
        }

        match execution.status {
            SagaStatus::Completed => return Ok(id),
            SagaStatus::Aborted => return Err(execution.failure()),
            SagaStatus::Running | SagaStatus::Compensating => {}
        }

        if let Some(step) = execution.halted_step {
            info!(transaction_id = %id, step = %execution.step_name(step), "operator resumed halted compensation");
            self.append(&mut execution, SagaLogEvent::InterventionCleared { step })
                .await?;
        } else {
            info!(transaction_id = %id, status = ?execution.status, "resuming saga");
        }

        self.drive(&definition, &mut execution, cancel).await
    }

    /// Resume every in-flight execution that does not need an operator.
    pub async fn recover(&self, cancel: &CancellationToken) -> ResilienceResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for id in self.log.in_flight().await? {
            match self.get_status(id).await {
                Ok(execution) if execution.requires_intervention() => {
                    report.halted.push(id);
                    continue;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(transaction_id = %id, error = %err, "saga log unreadable during recovery");
                    report.errors.push((id, err.to_string()));
                    continue;
                }
            }

            match self.resume(id, cancel).await {
                Ok(_) => report.completed.push(id),
                Err(ResilienceError::SagaStepFailed { .. }) => report.aborted.push(id),
                Err(ResilienceError::CompensationFailed { .. }) => report.halted.push(id),
                Err(ResilienceError::Cancelled) => return Err(ResilienceError::Cancelled),
                Err(err) => {
                    warn!(transaction_id = %id, error = %err, "saga recovery failed");
                    report.errors.push((id, err.to_string()));
                }
            }
        }

        info!(
            completed = report.completed.len(),
            aborted = report.aborted.len(),
            halted = report.halted.len(),
            errors = report.errors.len(),
            "saga recovery finished"
        );
        Ok(report)
    }

    async fn append(&self, execution: &mut SagaExecution, event: SagaLogEvent) -> ResilienceResult<()> {
        let record = SagaLogRecord {
            transaction_id: execution.transaction_id,
            sequence: execution.version + 1,
            recorded_at: self.clock.utc_now(),
            event,
        };
        self.log.append(record.clone()).await?;
        execution.apply(&record)
    }

    async fn drive(
        &self,
        definition: &SagaDefinition,
        execution: &mut SagaExecution,
        cancel: &CancellationToken,
    ) -> ResilienceResult<TransactionId> {
        let id = execution.transaction_id;

        while let Some(index) = execution.next_forward_step() {
            let step = definition.steps()[index].clone();
            let policy = definition.step_retry.as_ref().unwrap_or(&self.config.step_retry);
            let operation = format!("saga:{}:{}", definition.name(), step.name());
            let ctx = SagaContext::new(id, execution.data.clone(), cancel.clone());

            let result = self
                .retry
                .execute(&operation, policy, cancel, |_| {
                    let mut ctx = ctx.clone();
                    let step = step.clone();
                    async move {
                        step.forward(&mut ctx).await?;
                        Ok::<_, ResilienceError>(ctx.data)
                    }
                })
                .await;

            match result {
                Ok(data) => {
                    debug!(transaction_id = %id, step = %step.name(), "saga step committed");
                    self.append(execution, SagaLogEvent::StepCommitted { step: index, data })
                        .await?;
                }
                Err(ResilienceError::Cancelled) => {
                    info!(transaction_id = %id, step = %step.name(), "saga cancelled; execution stays in flight");
                    return Err(ResilienceError::Cancelled);
                }
                Err(err) => {
                    let reason = err.to_string();
                    warn!(transaction_id = %id, step = %step.name(), error = %reason, "saga step failed; compensating");
                    self.append(
                        execution,
                        SagaLogEvent::StepFailed {
                            step: index,
                            error: reason,
                        },
                    )
                    .await?;
                }
            }
        }

        // Also reached on resume when the log stops right after `StepFailed`.
        if execution.status == SagaStatus::Running && execution.failed_step.is_some() {
            let reason = execution.failure_reason.clone().unwrap_or_default();
            self.append(execution, SagaLogEvent::CompensationStarted { reason })
                .await?;
        }

        if execution.status == SagaStatus::Running {
            self.append(execution, SagaLogEvent::Completed).await?;
            info!(saga = %definition.name(), transaction_id = %id, "saga completed");
            self.metrics.record(ResilienceEvent::SagaCompleted {
                saga: definition.name().to_string(),
                transaction_id: id,
            });
            return Ok(id);
        }

        let compensation_policy = definition
            .compensation_retry
            .as_ref()
            .unwrap_or(&self.config.compensation_retry);

        while let Some(index) = execution.next_compensation() {
            let step = definition.steps()[index].clone();
            if !step.has_compensation() {
                debug!(transaction_id = %id, step = %step.name(), "nothing to compensate");
                self.append(execution, SagaLogEvent::StepCompensated { step: index })
                    .await?;
                continue;
            }

            let operation = format!("saga:{}:{}:compensate", definition.name(), step.name());
            let ctx = SagaContext::new(id, execution.data.clone(), cancel.clone());
            let result = self
                .retry
                .execute(&operation, compensation_policy, cancel, |_| {
                    let ctx = ctx.clone();
                    let step = step.clone();
                    async move { step.compensate(&ctx).await }
                })
                .await;

            match result {
                Ok(()) => {
                    debug!(transaction_id = %id, step = %step.name(), "saga step compensated");
                    self.append(execution, SagaLogEvent::StepCompensated { step: index })
                        .await?;
                }
                Err(ResilienceError::Cancelled) => {
                    info!(transaction_id = %id, step = %step.name(), "saga compensation cancelled; execution stays in flight");
                    return Err(ResilienceError::Cancelled);
                }
                Err(err) => {
                    let reason = err.to_string();
                    error!(
                        saga = %definition.name(),
                        transaction_id = %id,
                        step = %step.name(),
                        error = %reason,
                        "compensation failed; saga halted for operator intervention"
                    );
                    self.append(
                        execution,
                        SagaLogEvent::CompensationFailed {
                            step: index,
                            error: reason.clone(),
                        },
                    )
                    .await?;
                    self.metrics.record(ResilienceEvent::SagaHalted {
                        saga: definition.name().to_string(),
                        transaction_id: id,
                        step: step.name().to_string(),
                    });
                    return Err(ResilienceError::CompensationFailed {
                        transaction_id: id,
                        step: step.name().to_string(),
                        reason,
                    });
                }
            }
        }

        self.append(execution, SagaLogEvent::Aborted).await?;
        info!(saga = %definition.name(), transaction_id = %id, "saga aborted; compensations complete");
        self.metrics.record(ResilienceEvent::SagaCompensated {
            saga: definition.name().to_string(),
            transaction_id: id,
        });
        Err(execution.failure())
    }
}
