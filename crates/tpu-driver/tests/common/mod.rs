//! Shared setup for the integration tests

use tracing_subscriber::EnvFilter;

/// Route driver logs to the test harness; `RUST_LOG=tpu_driver=trace` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
