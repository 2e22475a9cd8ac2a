//! Telemetry helpers for structured logging and tracing.

/// Filter used by [`init_tracing_with_default`] when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "throttled_scheduler=info";

/// Initialize tracing/telemetry. Users can install their own subscriber; this
/// helper installs a default env-based subscriber if none is set.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Like [`init_tracing`], falling back to `default_filter` when `RUST_LOG`
/// is unset or invalid. Thread names are included since every task runs on
/// a named pool thread.
pub fn init_tracing_with_default(default_filter: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
