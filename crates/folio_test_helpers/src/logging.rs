//! Test logging configuration utilities

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per process
///
/// `RUST_LOG` wins over `directive` when set, so a single failing service test
/// can be rerun with `RUST_LOG=folio_sync=trace`. Later calls are ignored.
pub fn init_test_logging(directive: &str) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
        if installed.is_err() {
            tracing::debug!("test subscriber already installed");
        }
    });
}

/// Only errors; retries and rollbacks logged by the engine stay quiet
pub fn suppress_logs() {
    init_test_logging("error");
}

