//! Tracing/logging initialization.
//!
//! JSON logs with timestamps, filtered by `RUST_LOG` (default `info`).
//! Metric events are emitted under the `fluxora::metrics` target, so they can
//! be routed or silenced with a filter directive such as
//! `info,fluxora::metrics=off`.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter);
}

/// Initialize with explicit filter directives, ignoring `RUST_LOG`.
pub fn init_with_directives(directives: &str) {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter);
}

fn install(filter: EnvFilter) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .try_init();
}
