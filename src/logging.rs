//! Tracing subscriber setup for binaries and tests embedding the store.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, StoreError};

/// Installs a global `fmt` subscriber filtered by `filter`
/// (e.g. `"info,recstore::migration=debug"`).
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| StoreError::InvalidOwned(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StoreError::Invalid("logging already initialized"))
}

/// Like [`init_logging`], but `RUST_LOG` wins over `default_filter` and a
/// second call is silently ignored.
pub fn init_logging_from_env(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
