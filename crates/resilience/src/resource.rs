//! Bounded concurrency gate for external calls.
//!
//! Each named pool has a fixed number of permits. `acquire` suspends until a
//! permit frees up or the timeout elapses. Permits are handed out as
//! [`ResourceLease`]s that release themselves on drop.
//!
//! Reconfiguration only affects future acquisitions: growing a pool adds
//! permits immediately, shrinking it retires free permits now and retires the
//! rest as outstanding leases come back.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fluxora_core::{LeaseId, ResilienceError, ResilienceResult, SharedClock};
use fluxora_observability::{ResilienceEvent, SharedMetricsSink};

use crate::config::duration_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    /// Capacity of any pool without an explicit entry in `capacities`.
    pub default_capacity: usize,
    #[serde(with = "duration_ms", rename = "default_acquire_timeout_ms")]
    pub default_acquire_timeout: Duration,
    /// Expected maximum hold time; leases held longer are logged on release.
    #[serde(with = "duration_ms", rename = "lease_ttl_ms")]
    pub lease_ttl: Duration,
    pub capacities: BTreeMap<String, usize>,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            default_capacity: 10,
            default_acquire_timeout: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            capacities: BTreeMap::new(),
        }
    }
}

impl PoolsConfig {
    pub fn with_pool(mut self, name: impl Into<String>, capacity: usize) -> Self {
        self.capacities.insert(name.into(), capacity);
        self
    }

    pub fn capacity_for(&self, pool: &str) -> usize {
        self.capacities
            .get(pool)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.default_capacity == 0 {
            return Err(ResilienceError::config("pools.default_capacity must be > 0"));
        }
        if let Some((name, _)) = self.capacities.iter().find(|(_, c)| **c == 0) {
            return Err(ResilienceError::config(format!(
                "pools.capacities.{name} must be > 0"
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub available: usize,
}

#[derive(Debug)]
struct Pool {
    name: String,
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    in_use: AtomicUsize,
    /// Permits still to retire after a shrink; paid off by returning leases.
    retire: Mutex<usize>,
    clock: SharedClock,
}

impl Pool {
    fn new(name: &str, capacity: usize, clock: SharedClock) -> Self {
        Self {
            name: name.to_string(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            in_use: AtomicUsize::new(0),
            retire: Mutex::new(0),
            clock,
        }
    }

    fn resize(&self, new_capacity: usize) {
        let old = self.capacity.swap(new_capacity, Ordering::SeqCst);
        let mut retire = self.retire.lock().unwrap_or_else(|e| e.into_inner());

        if new_capacity >= old {
            let mut grow = new_capacity - old;
            // Cancel pending retirements first.
            let cancelled = grow.min(*retire);
            *retire -= cancelled;
            grow -= cancelled;
            self.semaphore.add_permits(grow);
            return;
        }

        *retire += old - new_capacity;
        while *retire > 0 {
            match self.semaphore.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    *retire -= 1;
                }
                Err(_) => break,
            }
        }
    }

    fn give_back(&self, permit: OwnedSemaphorePermit) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        let mut retire = self.retire.lock().unwrap_or_else(|e| e.into_inner());
        if *retire > 0 {
            *retire -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity.load(Ordering::SeqCst),
            in_use: self.in_use.load(Ordering::SeqCst),
            available: self.semaphore.available_permits(),
        }
    }
}

/// One permit from a bounded pool.
///
/// Released exactly once: either explicitly through [`ResourceLease::release`]
/// or when dropped.
#[derive(Debug)]
pub struct ResourceLease {
    id: LeaseId,
    acquired_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    pool: Arc<Pool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl ResourceLease {
    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool.name
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }

    /// Return the permit to the pool.
    ///
    /// A second call is a no-op and only logs a warning.
    pub fn release(&mut self) {
        let Some(permit) = self.permit.take() else {
            warn!(
                pool = %self.pool.name,
                lease_id = %self.id,
                "lease released twice; ignoring"
            );
            return;
        };

        let now = self.pool.clock.utc_now();
        if now > self.deadline {
            warn!(
                pool = %self.pool.name,
                lease_id = %self.id,
                held_ms = (now - self.acquired_at).num_milliseconds(),
                "lease held past its deadline"
            );
        }
        self.pool.give_back(permit);
        debug!(pool = %self.pool.name, lease_id = %self.id, "lease released");
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.release();
        }
    }
}

/// Registry of named bounded pools.
#[derive(Debug)]
pub struct ResourceManager {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    config: RwLock<PoolsConfig>,
    clock: SharedClock,
    metrics: SharedMetricsSink,
}

impl ResourceManager {
    pub fn new(config: PoolsConfig, clock: SharedClock, metrics: SharedMetricsSink) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            clock,
            metrics,
        }
    }

    pub fn default_acquire_timeout(&self) -> Duration {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .default_acquire_timeout
    }

    fn pool(&self, name: &str) -> Arc<Pool> {
        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return pool.clone();
        }

        // Lock order: `pools`, then `config`, the same as `reconfigure`.
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        pools
            .entry(name.to_string())
            .or_insert_with(|| {
                let capacity = self
                    .config
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .capacity_for(name);
                debug!(pool = %name, capacity, "creating resource pool");
                Arc::new(Pool::new(name, capacity, self.clock.clone()))
            })
            .clone()
    }

    /// Acquire a permit from `pool`, waiting at most `timeout`.
    pub async fn acquire(&self, pool: &str, timeout: Duration) -> ResilienceResult<ResourceLease> {
        self.acquire_inner(pool, timeout, None).await
    }

    /// Like [`acquire`](Self::acquire), but gives up with `Cancelled` when the
    /// token fires while waiting.
    pub async fn acquire_with_cancel(
        &self,
        pool: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ResilienceResult<ResourceLease> {
        self.acquire_inner(pool, timeout, Some(cancel)).await
    }

    async fn acquire_inner(
        &self,
        pool_name: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> ResilienceResult<ResourceLease> {
        let pool = self.pool(pool_name);
        let wait = tokio::time::timeout(timeout, pool.semaphore.clone().acquire_owned());

        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ResilienceError::Cancelled),
                res = wait => res,
            },
            None => wait.await,
        };

        let permit = match outcome {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ResilienceError::invalid_state(format!(
                    "resource pool '{pool_name}' is closed"
                )));
            }
            Err(_) => {
                warn!(pool = %pool_name, waited_ms = timeout.as_millis() as u64, "resource pool exhausted");
                self.metrics.record(ResilienceEvent::ResourceExhausted {
                    pool: pool_name.to_string(),
                });
                return Err(ResilienceError::ResourceExhausted {
                    pool: pool_name.to_string(),
                    waited: timeout,
                });
            }
        };

        pool.in_use.fetch_add(1, Ordering::SeqCst);
        let acquired_at = self.clock.utc_now();
        let ttl = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .lease_ttl;
        let deadline = acquired_at + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);

        let lease = ResourceLease {
            id: LeaseId::new(),
            acquired_at,
            deadline,
            pool,
            permit: Some(permit),
        };
        debug!(pool = %pool_name, lease_id = %lease.id, "lease acquired");
        Ok(lease)
    }

    /// Release a lease. Equivalent to [`ResourceLease::release`].
    pub fn release(&self, lease: &mut ResourceLease) {
        lease.release();
    }

    /// Run `f` while holding a lease from `pool`.
    pub async fn with_lease<F, Fut, T>(
        &self,
        pool: &str,
        timeout: Duration,
        f: F,
    ) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let mut lease = self.acquire(pool, timeout).await?;
        let result = f().await;
        lease.release();
        result
    }

    /// Stats for a pool, creating it if it has not been used yet.
    pub fn pool_stats(&self, pool: &str) -> PoolStats {
        self.pool(pool).stats()
    }

    /// Apply new pool settings. Outstanding leases are never revoked.
    pub fn reconfigure(&self, config: &PoolsConfig) -> ResilienceResult<()> {
        config.validate()?;
        // Held across the config swap so no pool is created from the old config.
        let pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        for (name, pool) in pools.iter() {
            let capacity = config.capacity_for(name);
            if capacity != pool.capacity.load(Ordering::SeqCst) {
                info!(pool = %name, capacity, "resizing resource pool");
                pool.resize(capacity);
            }
        }
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
        Ok(())
    }
}
