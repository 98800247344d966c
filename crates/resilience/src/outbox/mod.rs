//! Transactional outbox.
//!
//! Events are written to the outbox in the same unit of work as the business
//! change that produced them, then relayed to the broker asynchronously.
//! Delivery is at-least-once; consumers dedupe on the entry id, which is
//! also the published message id.

pub mod relay;
pub mod store;
pub mod types;

pub use relay::{OutboxConfig, OutboxRelay, RelayHandle, RelayStats};
pub use store::{InMemoryOutboxStore, OutboxStore, OutboxTransaction};
pub use types::{OutboxEntry, OutboxStatus, RelayReport};
