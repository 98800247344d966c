//! Resilience configuration.
//!
//! One serde document with a section per component. Every field has a default,
//! so a partial (or empty) document is valid. Durations are milliseconds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use fluxora_core::{ResilienceError, ResilienceResult};

use crate::breaker::BreakersConfig;
use crate::outbox::OutboxConfig;
use crate::resource::PoolsConfig;
use crate::retry::RetryPolicy;
use crate::saga::SagaConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "FLUXORA_RESILIENCE_CONFIG";

/// Serialize a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub breakers: BreakersConfig,
    pub pools: PoolsConfig,
    /// Default policy for callers that don't bring their own.
    pub retry: RetryPolicy,
    pub outbox: OutboxConfig,
    pub saga: SagaConfig,
}

impl ResilienceConfig {
    pub fn from_json_str(raw: &str) -> ResilienceResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ResilienceError::config(format!("invalid resilience config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> ResilienceResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ResilienceError::config(format!("read {}: {e}", path.display())))?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), "loaded resilience config");
        Ok(config)
    }

    /// Load the file named by `FLUXORA_RESILIENCE_CONFIG`, or defaults when unset.
    pub fn from_env() -> ResilienceResult<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_path(path.trim()),
            _ => {
                info!("{CONFIG_PATH_ENV} not set; using default resilience config");
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        self.breakers.validate()?;
        self.pools.validate()?;
        self.retry.validate()?;
        self.outbox.validate()?;
        self.saga.validate()
    }
}
