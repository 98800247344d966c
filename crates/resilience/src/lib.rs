//! `fluxora-resilience`: fault-tolerance primitives for services that talk to
//! flaky dependencies.
//!
//! - [`resource`]: bounded per-pool leases with acquire timeouts
//! - [`breaker`]: circuit breakers keyed by dependency
//! - [`retry`]: exponential backoff with jitter
//! - [`caller`]: retry around breaker around lease, in that order
//! - [`dlq`]: dead-letter queue for work that gave up
//! - [`outbox`]: transactional outbox and its relay
//! - [`saga`]: SAGA coordinator with a durable outcome log
//! - [`workers`]: broker consumers that retry and dead-letter
//!
//! Storage and transport adapters sit behind features: `postgres` (sqlx) and
//! `redis` (Redis Streams broker).

pub mod breaker;
pub mod caller;
pub mod config;
pub mod dlq;
pub mod fallback;
pub mod outbox;
pub mod resource;
pub mod retry;
pub mod saga;
pub mod workers;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis_broker;


pub use breaker::{BreakerConfig, BreakersConfig, CircuitBreaker, CircuitBreakerRegistry, CircuitMode};
pub use caller::{CallSpec, ResilientCaller};
pub use config::ResilienceConfig;
pub use dlq::{DeadLetterEntry, DeadLetterQueue, DeadLetterStore, InMemoryDeadLetterStore};
pub use outbox::{InMemoryOutboxStore, OutboxConfig, OutboxEntry, OutboxRelay, OutboxStore};
pub use resource::{PoolsConfig, ResourceLease, ResourceManager};
pub use retry::{RetryExecutor, RetryPolicy};
pub use saga::{SagaCoordinator, SagaDefinition, SagaLog, SagaStep};
pub use workers::{ConsumerWorker, MessageHandler};

pub use fluxora_core::{ResilienceError, ResilienceResult};
