//! Logging setup driven by the `LOG_LEVEL` environment variable.
//!
//! Recognized values are `DEBUG`, `INFO`, `WARNING`, `ERROR`, `FATAL` and
//! `PANIC`; anything else falls back to `INFO`. `FATAL` and `PANIC` have no
//! `tracing` counterpart and map to the `error` filter. `RUST_LOG` takes
//! precedence when set.

use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Map a `LOG_LEVEL` value onto a `tracing` filter directive.
pub fn filter_for(level: &str) -> &'static str {
    match level {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARNING" => "warn",
        "ERROR" | "FATAL" | "PANIC" => "error",
        _ => "info",
    }
}

/// Initialize the global subscriber from the `LOG_LEVEL` environment variable.
///
/// Idempotent; later calls are no-ops.
pub fn init() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_default();
    init_with_level(&level);
}

/// Initialize the global subscriber with an explicit `LOG_LEVEL`-style value.
pub fn init_with_level(level: &str) {
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(filter_for(level))),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
