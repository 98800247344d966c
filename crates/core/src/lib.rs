//! `fluxora-core`: shared building blocks for the resilience core.
//!
//! This crate holds the vocabulary every component speaks: identifiers, the
//! error taxonomy, and the clock abstraction. It contains no IO.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ResilienceError, ResilienceResult};
pub use id::{EntryId, LeaseId, TransactionId};
