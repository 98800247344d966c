//! Broker-facing message model.
//!
//! The resilience core never talks to a transport directly; it publishes and
//! consumes [`Message`]s through the [`MessageBroker`] trait. An in-memory
//! broker is provided for tests and single-process deployments.

pub mod broker;
pub mod in_memory_broker;
pub mod message;

pub use broker::{BrokerError, MessageBroker, PublishAck, Subscription};
pub use in_memory_broker::InMemoryBroker;
pub use message::Message;
