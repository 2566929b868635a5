//! Telemetry and logging initialization
//!
//! Structured logging with `tracing` and `tracing-subscriber`. All output goes to
//! stderr so that `folio ... --json` keeps stdout machine-readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directive when `RUST_LOG` is unset
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug,folio_sync=trace"
    } else {
        "info"
    }
}

/// Initialize the global tracing subscriber
///
/// # Arguments
/// * `verbose` - DEBUG level (TRACE for the sync engine) instead of INFO
/// * `json_format` - emit one JSON object per event
///
/// Calling this twice in one process is harmless: the second call keeps the
/// subscriber installed by the first.
///
/// # Example
/// ```
/// folio_common::telemetry::init_tracing(false, false);
/// tracing::info!("folio started");
/// ```
pub fn init_tracing(verbose: bool, json_format: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let result = if json_format {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(env_filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact(),
            )
            .with(env_filter)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
