//! Circuit breaking per downstream dependency.
//!
//! `Closed → Open` after `failure_threshold` consecutive counted failures.
//! `Open → HalfOpen` once `open_duration` has elapsed (checked lazily on the
//! next admission or state read). `HalfOpen → Closed` after
//! `success_threshold` consecutive successful trials; any counted trial
//! failure re-opens with a fresh timer.

pub mod circuit;
pub mod registry;
pub mod state;

pub use circuit::{CallPermit, CircuitBreaker};
pub use registry::{BreakersConfig, CircuitBreakerRegistry};
pub use state::{BreakerConfig, CircuitMode, CircuitSnapshot, FailureClassifier};
