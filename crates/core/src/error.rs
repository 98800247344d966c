//! Error model shared by every resilience component.

use std::time::Duration;

use thiserror::Error;

use crate::id::{EntryId, TransactionId};

/// Result type used across the resilience core.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Resilience-level error.
///
/// Operations wrapped by the breaker and the retry executor report their own
/// failures as `Retryable`, `NonRetryable` or `Timeout`; the remaining variants
/// are produced by the core itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    /// A bounded pool had no free permit before the acquire timeout elapsed.
    #[error("resource pool '{pool}' exhausted after waiting {waited:?}")]
    ResourceExhausted { pool: String, waited: Duration },

    /// The dependency's breaker rejected the call without running it.
    #[error("service temporarily degraded: circuit '{dependency}' is open")]
    CircuitOpen { dependency: String },

    /// A transient failure (5xx-equivalent, connection reset, ...).
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// A failure that will not go away by trying again (4xx-equivalent, validation, ...).
    #[error("non-retryable failure: {0}")]
    NonRetryable(String),

    /// The operation did not finish within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Every attempt of a retry policy failed.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<ResilienceError>,
    },

    /// An external cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A saga step failed irrecoverably and the saga was compensated.
    #[error("saga {transaction_id} step '{step}' failed: {reason}")]
    SagaStepFailed {
        transaction_id: TransactionId,
        step: String,
        reason: String,
    },

    /// A compensation failed; the saga is halted until an operator resumes it.
    #[error(
        "saga {transaction_id} compensation of step '{step}' failed: {reason} (operator intervention required)"
    )]
    CompensationFailed {
        transaction_id: TransactionId,
        step: String,
        reason: String,
    },

    /// An outbox entry could not be published and was moved to the dead-letter queue.
    #[error("outbox entry {entry_id} dispatch exhausted after {attempts} attempts")]
    DispatchExhausted { entry_id: EntryId, attempts: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    /// The requested transition is not allowed from the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ResilienceError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Default retry classification.
    ///
    /// An open circuit is deliberately not retryable: the breaker already
    /// decided the dependency is down, so spending the retry budget on it only
    /// delays the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Retryable(_) | Self::Timeout(_) | Self::ResourceExhausted { .. } | Self::Broker(_)
        )
    }

    /// Default breaker classification: does this failure say something about
    /// the health of the dependency?
    ///
    /// Client errors, local pool exhaustion and cancellation do not.
    pub fn counts_as_dependency_failure(&self) -> bool {
        matches!(
            self,
            Self::Retryable(_) | Self::Timeout(_) | Self::Broker(_) | Self::Storage(_)
        )
    }

    /// Fast-fail outcomes the API layer should surface as "temporarily degraded".
    pub fn is_degraded(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } | Self::ResourceExhausted { .. } => true,
            Self::RetriesExhausted { last_error, .. } => last_error.is_degraded(),
            _ => false,
        }
    }

    /// Terminal errors that need an operator before anything else happens.
    pub fn requires_intervention(&self) -> bool {
        matches!(self, Self::CompensationFailed { .. })
    }

    /// Stable, low-cardinality label (metrics, structured logs).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Retryable(_) => "retryable",
            Self::NonRetryable(_) => "non_retryable",
            Self::Timeout(_) => "timeout",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Cancelled => "cancelled",
            Self::SagaStepFailed { .. } => "saga_step_failed",
            Self::CompensationFailed { .. } => "compensation_failed",
            Self::DispatchExhausted { .. } => "dispatch_exhausted",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::InvalidId(_) => "invalid_id",
            Self::Storage(_) => "storage",
            Self::Broker(_) => "broker",
            Self::Config(_) => "config",
        }
    }

    /// Unwrap `RetriesExhausted` down to the failure that ended the last attempt.
    pub fn root_cause(&self) -> &ResilienceError {
        match self {
            Self::RetriesExhausted { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_circuit_is_degraded_but_not_retryable() {
        let err = ResilienceError::CircuitOpen {
            dependency: "forecast-api".into(),
        };
        assert!(err.is_degraded());
        assert!(!err.is_retryable());
        assert!(!err.counts_as_dependency_failure());
    }

    #[test]
    fn client_errors_do_not_count_against_the_dependency() {
        let err = ResilienceError::non_retryable("400 bad request");
        assert!(!err.counts_as_dependency_failure());
        assert!(!err.is_retryable());

        let err = ResilienceError::Timeout(Duration::from_secs(2));
        assert!(err.counts_as_dependency_failure());
        assert!(err.is_retryable());
    }

    #[test]
    fn root_cause_unwraps_nested_exhaustion() {
        let err = ResilienceError::RetriesExhausted {
            attempts: 3,
            last_error: Box::new(ResilienceError::CircuitOpen {
                dependency: "db".into(),
            }),
        };
        assert!(err.is_degraded());
        assert_eq!(err.root_cause().kind(), "circuit_open");
    }
}
