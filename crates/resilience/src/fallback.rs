//! Degraded answers for calls the breaker rejected or that failed.

use std::fmt;
use std::sync::{Arc, RwLock};

use fluxora_core::ResilienceError;

/// Produces a substitute value for a failed call, or `None` to surface the error.
pub trait Fallback<T>: Send + Sync {
    fn recover(&self, error: &ResilienceError) -> Option<T>;
}

impl<T, F> Fallback<T> for F
where
    F: Fn(&ResilienceError) -> Option<T> + Send + Sync,
{
    fn recover(&self, error: &ResilienceError) -> Option<T> {
        self(error)
    }
}

/// Always answers with a fixed value.
#[derive(Debug, Clone)]
pub struct DefaultValueFallback<T> {
    value: T,
}

impl<T> DefaultValueFallback<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T: Clone + Send + Sync> Fallback<T> for DefaultValueFallback<T> {
    fn recover(&self, _error: &ResilienceError) -> Option<T> {
        Some(self.value.clone())
    }
}

/// Serves the last value stored with [`CachedFallback::store`].
///
/// Callers update the cache after each successful call; until the first
/// store there is nothing to serve and the error surfaces.
pub struct CachedFallback<T> {
    last_good: Arc<RwLock<Option<T>>>,
}

impl<T> CachedFallback<T> {
    pub fn new() -> Self {
        Self {
            last_good: Arc::new(RwLock::new(None)),
        }
    }

    pub fn store(&self, value: T) {
        *self.last_good.write().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }

    pub fn clear(&self) {
        *self.last_good.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

impl<T> Default for CachedFallback<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CachedFallback<T> {
    fn clone(&self) -> Self {
        Self {
            last_good: self.last_good.clone(),
        }
    }
}

impl<T> fmt::Debug for CachedFallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFallback").finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync> Fallback<T> for CachedFallback<T> {
    fn recover(&self, _error: &ResilienceError) -> Option<T> {
        self.last_good
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Tries each fallback in order; the first one with an answer wins.
pub struct ChainedFallback<T> {
    chain: Vec<Box<dyn Fallback<T>>>,
}

impl<T> ChainedFallback<T> {
    pub fn new() -> Self {
        Self { chain: Vec::new() }
    }

    pub fn then(mut self, fallback: impl Fallback<T> + 'static) -> Self {
        self.chain.push(Box::new(fallback));
        self
    }
}

impl<T> Default for ChainedFallback<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ChainedFallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedFallback")
            .field("len", &self.chain.len())
            .finish()
    }
}

impl<T> Fallback<T> for ChainedFallback<T> {
    fn recover(&self, error: &ResilienceError) -> Option<T> {
        self.chain.iter().find_map(|f| f.recover(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> ResilienceError {
        ResilienceError::CircuitOpen {
            dependency: "forecast-api".into(),
        }
    }

    #[test]
    fn cache_is_empty_until_a_good_value_is_stored() {
        let cache = CachedFallback::new();
        assert_eq!(cache.recover(&open()), None);
        cache.store(vec![1.5, 2.5]);
        assert_eq!(cache.recover(&open()), Some(vec![1.5, 2.5]));
    }

    #[test]
    fn chain_falls_through_to_the_first_answer() {
        let cache: CachedFallback<&'static str> = CachedFallback::new();
        let only_when_open = |e: &ResilienceError| e.is_degraded().then_some("degraded");
        let chain = ChainedFallback::new()
            .then(cache.clone())
            .then(only_when_open)
            .then(DefaultValueFallback::new("default"));

        assert_eq!(chain.recover(&open()), Some("degraded"));
        assert_eq!(
            chain.recover(&ResilienceError::retryable("boom")),
            Some("default")
        );

        cache.store("cached");
        assert_eq!(chain.recover(&open()), Some("cached"));
    }
}
