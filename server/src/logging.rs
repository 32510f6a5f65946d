//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured
//! level; the format (pretty/compact/json) and field toggles come from
//! [`LoggingConfig`].

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize the logging subsystem. Call once at startup, before any
/// worker threads exist.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_ansi(true)
                .with_target(config.target)
                .with_thread_names(config.thread_names);
            if config.timestamps {
                registry.with(layer).init();
            } else {
                registry.with(layer.without_time()).init();
            }
        }
        LogFormat::Compact => {
            let layer = fmt::layer()
                .compact()
                .with_ansi(true)
                .with_target(config.target)
                .with_thread_names(config.thread_names);
            if config.timestamps {
                registry.with(layer).init();
            } else {
                registry.with(layer.without_time()).init();
            }
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_target(config.target)
                .with_thread_names(config.thread_names);
            if config.timestamps {
                registry.with(layer).init();
            } else {
                registry.with(layer.without_time()).init();
            }
        }
    }
}
