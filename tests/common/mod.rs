//! Shared test helpers: a one-time `tracing` subscriber install so `RUST_LOG` can surface the
//! library's structured logging while a scenario test runs.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs a `tracing` subscriber controlled by `RUST_LOG`, defaulting to no output. Safe to call
/// from every test; only the first call takes effect.
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")))
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
