//! Postgres-backed stores (feature `postgres`).
//!
//! Schema: `migrations/0001_resilience_core.sql`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | ResilienceError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `InvalidState` (duplicate id or log sequence) |
//! | Database (check violation) | `23514` | `InvalidState` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / Other | N/A | `Storage` |
//!
//! `Storage` counts as a dependency failure for the breaker; `InvalidState`
//! does not.

mod dead_letter;
mod outbox;
mod saga_log;

pub use dead_letter::PostgresDeadLetterStore;
pub use outbox::PostgresOutboxStore;
pub use saga_log::PostgresSagaLog;

use fluxora_core::ResilienceError;

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ResilienceError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") => ResilienceError::invalid_state(msg),
                _ => ResilienceError::storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            ResilienceError::storage(format!("connection pool closed in {}", operation))
        }
        other => ResilienceError::storage(format!("{}: {}", operation, other)),
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

pub(crate) fn decode_error(what: &str, err: impl std::fmt::Display) -> ResilienceError {
    ResilienceError::storage(format!("failed to decode {} row: {}", what, err))
}
