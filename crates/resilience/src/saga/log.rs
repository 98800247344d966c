//! Append-only saga outcome log.
//!
//! The log is the single source of truth for an execution: every transition
//! is appended before the coordinator moves on, and `SagaExecution::replay`
//! folds the records back into the current state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use fluxora_core::{ResilienceError, ResilienceResult, TransactionId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SagaLogEvent {
    Started {
        saga: String,
        steps: Vec<String>,
        data: Map<String, JsonValue>,
    },
    /// Forward action succeeded; `data` is the context after the step.
    StepCommitted {
        step: usize,
        data: Map<String, JsonValue>,
    },
    StepFailed {
        step: usize,
        error: String,
    },
    CompensationStarted {
        reason: String,
    },
    StepCompensated {
        step: usize,
    },
    /// Compensation failed irrecoverably; the execution waits for an operator.
    CompensationFailed {
        step: usize,
        error: String,
    },
    /// An operator asked to retry a halted compensation.
    InterventionCleared {
        step: usize,
    },
    Completed,
    Aborted,
}

impl SagaLogEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SagaLogEvent::Started { .. } => "started",
            SagaLogEvent::StepCommitted { .. } => "step_committed",
            SagaLogEvent::StepFailed { .. } => "step_failed",
            SagaLogEvent::CompensationStarted { .. } => "compensation_started",
            SagaLogEvent::StepCompensated { .. } => "step_compensated",
            SagaLogEvent::CompensationFailed { .. } => "compensation_failed",
            SagaLogEvent::InterventionCleared { .. } => "intervention_cleared",
            SagaLogEvent::Completed => "completed",
            SagaLogEvent::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaLogEvent::Completed | SagaLogEvent::Aborted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaLogRecord {
    pub transaction_id: TransactionId,
    /// 1-based position in the execution's log.
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: SagaLogEvent,
}

#[async_trait]
pub trait SagaLog: Send + Sync {
    /// Append a record. Fails with `InvalidState` unless `record.sequence`
    /// is exactly one past the last stored sequence for the execution.
    async fn append(&self, record: SagaLogRecord) -> ResilienceResult<()>;

    /// Every record of an execution, in sequence order. Empty if unknown.
    async fn load(&self, transaction_id: TransactionId) -> ResilienceResult<Vec<SagaLogRecord>>;

    /// Executions whose last record is not terminal.
    async fn in_flight(&self) -> ResilienceResult<Vec<TransactionId>>;
}

#[async_trait]
impl<S> SagaLog for Arc<S>
where
    S: SagaLog + ?Sized,
{
    async fn append(&self, record: SagaLogRecord) -> ResilienceResult<()> {
        (**self).append(record).await
    }

    async fn load(&self, transaction_id: TransactionId) -> ResilienceResult<Vec<SagaLogRecord>> {
        (**self).load(transaction_id).await
    }

    async fn in_flight(&self) -> ResilienceResult<Vec<TransactionId>> {
        (**self).in_flight().await
    }
}

#[derive(Debug, Default)]
pub struct InMemorySagaLog {
    streams: RwLock<HashMap<TransactionId, Vec<SagaLogRecord>>>,
}

impl InMemorySagaLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SagaLog for InMemorySagaLog {
    async fn append(&self, record: SagaLogRecord) -> ResilienceResult<()> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| ResilienceError::storage("saga log lock poisoned"))?;
        let stream = streams.entry(record.transaction_id).or_default();
        let expected = stream.len() as u64 + 1;
        if record.sequence != expected {
            return Err(ResilienceError::invalid_state(format!(
                "saga {} log conflict: expected sequence {expected}, got {}",
                record.transaction_id, record.sequence
            )));
        }
        stream.push(record);
        Ok(())
    }

    async fn load(&self, transaction_id: TransactionId) -> ResilienceResult<Vec<SagaLogRecord>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| ResilienceError::storage("saga log lock poisoned"))?;
        Ok(streams.get(&transaction_id).cloned().unwrap_or_default())
    }

    async fn in_flight(&self) -> ResilienceResult<Vec<TransactionId>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| ResilienceError::storage("saga log lock poisoned"))?;
        let mut ids: Vec<TransactionId> = streams
            .iter()
            .filter(|(_, records)| records.last().is_some_and(|r| !r.event.is_terminal()))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
