use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fluxora_core::{ResilienceError, ResilienceResult};

use crate::config::duration_ms;

/// Mode of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitMode {
    /// Calls flow; consecutive counted failures are tracked.
    Closed,
    /// Calls fail fast until the open duration elapses.
    Open,
    /// A bounded number of trial calls decide whether to close or re-open.
    HalfOpen,
}

impl fmt::Display for CircuitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitMode::Closed => "closed",
            CircuitMode::Open => "open",
            CircuitMode::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Thresholds for one circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive counted failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive successful trials that close a half-open circuit.
    pub success_threshold: u32,
    #[serde(with = "duration_ms", rename = "open_duration_ms")]
    pub open_duration: Duration,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_max_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            half_open_max_trials: 1,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            open_duration,
            ..Default::default()
        }
    }

    pub fn with_half_open_trials(mut self, trials: u32) -> Self {
        self.half_open_max_trials = trials;
        self
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::config("failure_threshold must be > 0"));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::config("success_threshold must be > 0"));
        }
        if self.half_open_max_trials == 0 {
            return Err(ResilienceError::config("half_open_max_trials must be > 0"));
        }
        Ok(())
    }
}

/// Decides whether a failure counts against the dependency's health.
///
/// The default counts transient failures and timeouts; client errors and
/// local conditions (pool exhaustion, cancellation) are neutral.
#[derive(Clone)]
pub struct FailureClassifier(Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>);

impl FailureClassifier {
    pub fn from_fn(f: impl Fn(&ResilienceError) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn counts(&self, err: &ResilienceError) -> bool {
        (self.0)(err)
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::from_fn(ResilienceError::counts_as_dependency_failure)
    }
}

impl fmt::Debug for FailureClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureClassifier(..)")
    }
}

/// Read-only view of a circuit, for dashboards and operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub mode: CircuitMode,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub trials_in_flight: u32,
    pub seconds_since_transition: f64,
}
