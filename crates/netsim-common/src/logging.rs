//! Logging initialisation shared by netsim binaries.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `log_level` when set. With `json`
/// enabled every event is emitted as one JSON object per line, including
/// source file and line number.
///
/// Calling this twice is harmless: the second attempt is ignored.
pub fn init_logging(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_thread_ids(true))
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already initialized");
    }
}
