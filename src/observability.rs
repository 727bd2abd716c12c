//! Tracing bootstrap helpers for embedders
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the embedder's choice. These helpers cover the common cases and are safe
//! to call more than once.

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs a human-readable subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .try_init();
}

/// Installs a JSON-lines subscriber honouring `RUST_LOG`, for log shippers
pub fn init_tracing_json() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter())
        .try_init();
}
