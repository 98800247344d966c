//! Dead-letter queue: terminal sink for work that exhausted its retries.
//!
//! ## Components
//!
//! - `DeadLetterEntry`: payload, last error, attempt count and timestamps
//! - `DeadLetterStore`: persistence (in-memory here, Postgres behind a feature)
//! - `DeadLetterQueue`: park / list / replay / discard, with logging and metrics

pub mod queue;
pub mod store;
pub mod types;

pub use queue::DeadLetterQueue;
pub use store::{DeadLetterStore, InMemoryDeadLetterStore};
pub use types::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterOrigin, DeadLetterStats, DeadLetterStatus,
    REPLAY_HEADER, SourceStats,
};
