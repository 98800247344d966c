use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use fluxora_core::{ResilienceResult, SharedClock};
use fluxora_observability::SharedMetricsSink;

use super::circuit::CircuitBreaker;
use super::state::{BreakerConfig, CircuitSnapshot, FailureClassifier};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakersConfig {
    /// Thresholds for any dependency without an override.
    pub default: BreakerConfig,
    pub overrides: BTreeMap<String, BreakerConfig>,
}

impl BreakersConfig {
    pub fn with_override(mut self, dependency: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    pub fn config_for(&self, dependency: &str) -> &BreakerConfig {
        self.overrides.get(dependency).unwrap_or(&self.default)
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        self.default.validate()?;
        for cfg in self.overrides.values() {
            cfg.validate()?;
        }
        Ok(())
    }
}

/// Shared registry of per-dependency breakers.
///
/// Breakers are created lazily on first use of a dependency name and live
/// as long as the registry.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    classifiers: RwLock<HashMap<String, FailureClassifier>>,
    config: BreakersConfig,
    clock: SharedClock,
    metrics: SharedMetricsSink,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakersConfig, clock: SharedClock, metrics: SharedMetricsSink) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            classifiers: RwLock::new(HashMap::new()),
            config,
            clock,
            metrics,
        }
    }

    /// Use a custom failure classifier for `dependency`.
    ///
    /// Only affects breakers created afterwards; register classifiers before
    /// the first call.
    pub fn with_classifier(self, dependency: impl Into<String>, classifier: FailureClassifier) -> Self {
        self.classifiers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dependency.into(), classifier);
        self
    }

    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(cb) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dependency)
        {
            return cb.clone();
        }

        let classifier = self
            .classifiers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dependency)
            .cloned()
            .unwrap_or_default();

        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                debug!(dependency = %dependency, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    dependency,
                    self.config.config_for(dependency).clone(),
                    classifier,
                    self.clock.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    pub async fn execute<T, F, Fut>(&self, dependency: &str, op: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let breaker = self.get(dependency);
        breaker.execute(op).await
    }

    /// Reset a breaker to closed. Returns `false` if the dependency was never used.
    pub fn reset(&self, dependency: &str) -> bool {
        let breaker = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(dependency)
            .cloned();
        match breaker {
            Some(cb) => {
                cb.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshots of every known breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut out: Vec<CircuitSnapshot> = breakers.iter().map(|cb| cb.state()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
