//! Retry with exponential backoff and jitter.
//!
//! ## Components
//!
//! - `RetryPolicy`: attempt budget, delay curve, retryable-error predicate
//! - `RetryExecutor`: the retry loop (cancellable, instrumented)

pub mod executor;
pub mod policy;

pub use executor::RetryExecutor;
pub use policy::{RetryClassifier, RetryPolicy};
