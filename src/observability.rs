//! Logging setup and span helpers.
//!
//! Hook output owns stdout, so every log line goes to stderr.

use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON structured logs, one object per line.
    Json,
    /// Human-readable multi-line logs.
    #[default]
    Pretty,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

/// Installs the global subscriber. Subsequent calls are no-ops.
///
/// `level` is an `EnvFilter` directive (`info`, `gearctl=debug,warn`). An
/// unparsable directive falls back to `info`.
pub fn init_logging(level: &str, format: LogFormat) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_writer(std::io::stderr))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .init();
            }
        }
    });
}

/// Span for one CLI invocation against a gear.
#[must_use]
pub fn gear_span(operation: &str, gear_uuid: &str) -> Span {
    tracing::info_span!("gear", op = operation, gear = gear_uuid)
}
