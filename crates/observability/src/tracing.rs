//! Tracing/logging initialization.
//!
//! - `RUST_LOG` selects the filter (default `info`)
//! - `LOG_FORMAT` selects `json` (default) or `pretty` output

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown log format {0:?} (expected json or pretty)")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(UnknownLogFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset or invalid.
    pub default_directive: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            default_directive: "info".to_string(),
        }
    }
}

impl TracingConfig {
    /// Read `LOG_FORMAT`; unknown values fall back to JSON.
    pub fn from_env() -> Self {
        let format = std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();

        Self {
            format,
            ..Self::default()
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(config: TracingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}
