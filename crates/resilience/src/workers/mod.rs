//! Background workers built on the resilience primitives.

pub mod consumer_worker;

pub use consumer_worker::{
    ConsumerConfig, ConsumerWorker, MessageHandler, MessageOutcome, WorkerHandle, WorkerStats,
};
