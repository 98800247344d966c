use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use fluxora_core::{ResilienceError, ResilienceResult, TransactionId};

use super::log::{SagaLogEvent, SagaLogRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Completed,
    Compensating,
    Aborted,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Pending,
    Committed,
    Failed,
    Compensated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub outcome: StepOutcome,
    pub last_error: Option<String>,
}

/// Current state of one saga execution, derived from its log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    pub transaction_id: TransactionId,
    pub saga: String,
    pub status: SagaStatus,
    pub steps: Vec<StepState>,
    pub data: Map<String, JsonValue>,
    /// Step whose forward action failed, when compensating or aborted.
    pub failed_step: Option<usize>,
    pub failure_reason: Option<String>,
    /// Step whose compensation failed; set while waiting for an operator.
    pub halted_step: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sequence of the last applied record.
    pub version: u64,
}

impl SagaExecution {
    /// Rebuild an execution from its records.
    pub fn replay(records: &[SagaLogRecord]) -> ResilienceResult<Self> {
        let (first, rest) = records
            .split_first()
            .ok_or_else(|| ResilienceError::not_found("saga execution has no records"))?;

        let SagaLogEvent::Started { saga, steps, data } = &first.event else {
            return Err(ResilienceError::invalid_state(format!(
                "saga {} log starts with `{}`",
                first.transaction_id,
                first.event.kind()
            )));
        };

        let mut execution = Self {
            transaction_id: first.transaction_id,
            saga: saga.clone(),
            status: SagaStatus::Running,
            steps: steps
                .iter()
                .map(|name| StepState {
                    name: name.clone(),
                    outcome: StepOutcome::Pending,
                    last_error: None,
                })
                .collect(),
            data: data.clone(),
            failed_step: None,
            failure_reason: None,
            halted_step: None,
            started_at: first.recorded_at,
            updated_at: first.recorded_at,
            version: first.sequence,
        };

        for record in rest {
            execution.apply(record)?;
        }
        Ok(execution)
    }

    /// Fold one record into the state.
    pub fn apply(&mut self, record: &SagaLogRecord) -> ResilienceResult<()> {
        if record.transaction_id != self.transaction_id {
            return Err(ResilienceError::invalid_state(format!(
                "record for {} applied to saga {}",
                record.transaction_id, self.transaction_id
            )));
        }
        if record.sequence != self.version + 1 {
            return Err(ResilienceError::invalid_state(format!(
                "saga {} expected record {}, got {}",
                self.transaction_id,
                self.version + 1,
                record.sequence
            )));
        }

        match &record.event {
            SagaLogEvent::Started { .. } => {
                return Err(ResilienceError::invalid_state(format!(
                    "saga {} started twice",
                    self.transaction_id
                )));
            }
            SagaLogEvent::StepCommitted { step, data } => {
                self.step_mut(*step)?.outcome = StepOutcome::Committed;
                self.data = data.clone();
            }
            SagaLogEvent::StepFailed { step, error } => {
                let state = self.step_mut(*step)?;
                state.outcome = StepOutcome::Failed;
                state.last_error = Some(error.clone());
                self.failed_step = Some(*step);
                self.failure_reason = Some(error.clone());
            }
            SagaLogEvent::CompensationStarted { reason } => {
                self.status = SagaStatus::Compensating;
                if self.failure_reason.is_none() {
                    self.failure_reason = Some(reason.clone());
                }
            }
            SagaLogEvent::StepCompensated { step } => {
                let state = self.step_mut(*step)?;
                state.outcome = StepOutcome::Compensated;
                state.last_error = None;
                self.halted_step = None;
            }
            SagaLogEvent::CompensationFailed { step, error } => {
                self.step_mut(*step)?.last_error = Some(error.clone());
                self.halted_step = Some(*step);
            }
            SagaLogEvent::InterventionCleared { step } => {
                self.step_mut(*step)?;
                self.halted_step = None;
            }
            SagaLogEvent::Completed => self.status = SagaStatus::Completed,
            SagaLogEvent::Aborted => self.status = SagaStatus::Aborted,
        }

        self.version = record.sequence;
        self.updated_at = record.recorded_at;
        Ok(())
    }

    fn step_mut(&mut self, index: usize) -> ResilienceResult<&mut StepState> {
        let id = self.transaction_id;
        self.steps
            .get_mut(index)
            .ok_or_else(|| ResilienceError::invalid_state(format!("saga {id} has no step {index}")))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Halted in `Compensating` until an operator resumes it.
    pub fn requires_intervention(&self) -> bool {
        self.status == SagaStatus::Compensating && self.halted_step.is_some()
    }

    /// Next forward step to run while `Running`.
    ///
    /// A recorded step failure ends the forward phase even if the
    /// `CompensationStarted` record was never written.
    pub fn next_forward_step(&self) -> Option<usize> {
        if self.status != SagaStatus::Running || self.failed_step.is_some() {
            return None;
        }
        self.steps.iter().position(|s| s.outcome == StepOutcome::Pending)
    }

    /// Latest committed, not yet compensated step while `Compensating`.
    pub fn next_compensation(&self) -> Option<usize> {
        if self.status != SagaStatus::Compensating {
            return None;
        }
        self.steps.iter().rposition(|s| s.outcome == StepOutcome::Committed)
    }

    pub fn step_name(&self, index: usize) -> &str {
        self.steps.get(index).map(|s| s.name.as_str()).unwrap_or("unknown")
    }

    /// The error a caller sees for this execution's failure.
    pub fn failure(&self) -> ResilienceError {
        let step = self
            .failed_step
            .map(|i| self.step_name(i).to_string())
            .unwrap_or_default();
        ResilienceError::SagaStepFailed {
            transaction_id: self.transaction_id,
            step,
            reason: self.failure_reason.clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        id: TransactionId,
        records: Vec<SagaLogRecord>,
    }

    impl Recorder {
        fn new(steps: &[&str]) -> Self {
            let mut recorder = Self {
                id: TransactionId::new(),
                records: Vec::new(),
            };
            recorder.push(SagaLogEvent::Started {
                saga: "provision".into(),
                steps: steps.iter().map(|s| s.to_string()).collect(),
                data: Map::new(),
            });
            recorder
        }

        fn push(&mut self, event: SagaLogEvent) -> &mut Self {
            self.records.push(SagaLogRecord {
                transaction_id: self.id,
                sequence: self.records.len() as u64 + 1,
                recorded_at: Utc::now(),
                event,
            });
            self
        }
    }

    fn committed(step: usize) -> SagaLogEvent {
        let mut data = Map::new();
        data.insert(format!("step{step}"), JsonValue::Bool(true));
        SagaLogEvent::StepCommitted { step, data }
    }

    #[test]
    fn replay_tracks_committed_steps_and_data() {
        let mut r = Recorder::new(&["reserve", "charge", "notify"]);
        r.push(committed(0)).push(committed(1));

        let exec = SagaExecution::replay(&r.records).unwrap();
        assert_eq!(exec.status, SagaStatus::Running);
        assert_eq!(exec.next_forward_step(), Some(2));
        assert_eq!(exec.data.get("step1"), Some(&JsonValue::Bool(true)));
        assert_eq!(exec.version, 3);
    }

    #[test]
    fn compensation_walks_committed_steps_in_reverse() {
        let mut r = Recorder::new(&["a", "b", "c", "d"]);
        r.push(committed(0))
            .push(committed(1))
            .push(SagaLogEvent::StepFailed {
                step: 2,
                error: "boom".into(),
            })
            .push(SagaLogEvent::CompensationStarted { reason: "boom".into() });

        let mut exec = SagaExecution::replay(&r.records).unwrap();
        assert_eq!(exec.status, SagaStatus::Compensating);
        assert_eq!(exec.next_forward_step(), None);
        assert_eq!(exec.next_compensation(), Some(1));

        r.push(SagaLogEvent::StepCompensated { step: 1 });
        exec = SagaExecution::replay(&r.records).unwrap();
        assert_eq!(exec.next_compensation(), Some(0));
        assert_eq!(exec.steps[1].outcome, StepOutcome::Compensated);
        assert_eq!(exec.steps[2].outcome, StepOutcome::Failed);

        match exec.failure() {
            ResilienceError::SagaStepFailed { step, reason, .. } => {
                assert_eq!(step, "c");
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn recorded_failure_stops_forward_progress() {
        let mut r = Recorder::new(&["a", "b", "c"]);
        r.push(committed(0)).push(SagaLogEvent::StepFailed {
            step: 1,
            error: "declined".into(),
        });

        let exec = SagaExecution::replay(&r.records).unwrap();
        assert_eq!(exec.status, SagaStatus::Running);
        assert_eq!(exec.failed_step, Some(1));
        assert_eq!(exec.next_forward_step(), None);
        assert!(!exec.is_terminal());
    }

    #[test]
    fn halted_flag_clears_on_intervention() {
        let mut r = Recorder::new(&["a"]);
        r.push(committed(0))
            .push(SagaLogEvent::CompensationStarted { reason: "x".into() })
            .push(SagaLogEvent::CompensationFailed {
                step: 0,
                error: "refund api down".into(),
            });
        let exec = SagaExecution::replay(&r.records).unwrap();
        assert!(exec.requires_intervention());
        assert_eq!(exec.halted_step, Some(0));

        r.push(SagaLogEvent::InterventionCleared { step: 0 });
        let exec = SagaExecution::replay(&r.records).unwrap();
        assert!(!exec.requires_intervention());
        assert_eq!(exec.next_compensation(), Some(0));
    }

    #[test]
    fn gaps_and_foreign_records_are_rejected() {
        let mut r = Recorder::new(&["a"]);
        r.push(committed(0));
        r.records[1].sequence = 5;
        assert!(SagaExecution::replay(&r.records).is_err());

        let r = Recorder::new(&["a"]);
        let mut exec = SagaExecution::replay(&r.records).unwrap();
        let foreign = SagaLogRecord {
            transaction_id: TransactionId::new(),
            sequence: 2,
            recorded_at: Utc::now(),
            event: SagaLogEvent::Completed,
        };
        assert!(exec.apply(&foreign).is_err());
        assert!(SagaExecution::replay(&[]).is_err());
    }
}
