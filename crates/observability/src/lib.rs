//! Tracing/logging setup shared by every LedgerDesk process.
//!
//! The queue (and the rest of the platform) only *emits* `tracing` events and
//! spans; installing a subscriber is the embedding process's job, done once at
//! startup via [`init`]. Nothing in the library crates owns global logger
//! state.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// JSON logs with timestamps, filterable via `RUST_LOG`. Safe to call multiple
/// times; subsequent calls become no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
