//! Retry policy: attempt budget, exponential backoff and jitter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use fluxora_core::{ResilienceError, ResilienceResult};

use crate::config::duration_ms;

/// Decides whether an error is worth another attempt.
#[derive(Clone)]
pub struct RetryClassifier(Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>);

impl RetryClassifier {
    pub fn from_fn(f: impl Fn(&ResilienceError) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn is_retryable(&self, err: &ResilienceError) -> bool {
        (self.0)(err)
    }
}

impl Default for RetryClassifier {
    fn default() -> Self {
        Self::from_fn(ResilienceError::is_retryable)
    }
}

impl fmt::Debug for RetryClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryClassifier(..)")
    }
}

/// Immutable retry configuration, shared read-only between callers.
///
/// `max_attempts` counts every attempt including the first, so
/// `max_attempts = 1` means "no retries".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Each delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    #[serde(skip)]
    pub classifier: RetryClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.1,
            classifier: RetryClassifier::default(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Constant delay, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
            classifier: RetryClassifier::default(),
        }
    }

    /// Doubling delay from `base_delay` up to `max_delay`, 10% jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: 0.1,
            classifier: RetryClassifier::default(),
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::config("retry max_attempts must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ResilienceError::config("retry jitter must be within [0, 1]"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ResilienceError::config("retry multiplier must be >= 1"));
        }
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::config("retry max_delay must be >= base_delay"));
        }
        Ok(())
    }

    /// Delay after the `attempt`-th failure, before jitter.
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`; zero for attempt 0.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if secs.is_nan() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(secs)
            .map(|d| d.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }

    /// Jittered delay after the `attempt`-th failure.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        base.mul_f64(factor)
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
