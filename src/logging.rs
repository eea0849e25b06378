//! # Logging Setup
//!
//! Console logging through `tracing-subscriber`, with an optional daily
//! rolling file written by `tracing-appender`. `RUST_LOG` overrides the
//! configured level.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Keeps the non-blocking file writer alive; logs stop flushing once dropped.
#[derive(Debug, Default)]
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

/// Build the level filter from `RUST_LOG`, falling back to the configured level
pub fn level_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber
///
/// Returns a guard that must be held for the lifetime of the process when
/// file logging is enabled.
pub fn init_logging(config: &LoggingConfig) -> LoggingGuard {
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let (file_layer, guard) = if config.file_enabled {
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_writer(writer).with_ansi(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(level_filter(config))
        .with(console_layer)
        .with(file_layer)
        .init();

    LoggingGuard { _guard: guard }
}
