//! Logging pipeline: `tracing` with a compact or JSON formatter.
//!
//! Environment-driven: `S5B_LOG_LEVEL` feeds the `EnvFilter` (default
//! `info`), `S5B_LOG_FORMAT` picks `compact` or `json`.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Compact,
    Json,
}

fn format_from_env() -> LogFormat {
    match std::env::var("S5B_LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Compact,
    }
}

fn filter_from_env() -> EnvFilter {
    let level = std::env::var("S5B_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    EnvFilter::new(level)
}

/// Install the global subscriber. Errors if called twice.
pub fn init() -> Result<()> {
    let filter = filter_from_env();
    match format_from_env() {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true).with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        LogFormat::Compact => {
            let layer = fmt::layer().compact().with_target(true).with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }
    Ok(())
}
