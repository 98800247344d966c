//! SAGA transaction coordinator.
//!
//! A saga is an ordered list of steps, each with a forward action and an
//! optional compensation. Steps run one at a time; when a forward action
//! fails irrecoverably the committed steps are compensated in reverse order.
//! A compensation that gives up halts the execution in `Compensating` until
//! an operator resumes it.
//!
//! Every transition is appended to the [`SagaLog`] before the coordinator
//! moves on, so `recover` can pick up in-flight executions after a restart.

pub mod coordinator;
pub mod execution;
pub mod log;
pub mod step;

pub use coordinator::{RecoveryReport, SagaConfig, SagaCoordinator, SagaStart};
pub use execution::{SagaExecution, SagaStatus, StepOutcome, StepState};
pub use log::{InMemorySagaLog, SagaLog, SagaLogEvent, SagaLogRecord};
pub use step::{SagaContext, SagaDefinition, SagaStep};
