//! Trace collection and processing for diagnosing SLO faults in microservice applications.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

pub mod compose;
pub mod export;
pub mod jaeger;
pub mod playground;
pub mod show;
pub mod tree;

/// Install a global `tracing` subscriber configured from `RUST_LOG`.
///
/// Defaults to `info` when `RUST_LOG` is unset. Safe to call more than once.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // A subscriber may already be set by the embedding application.
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
