//! Logging setup for the pgmux binary
//!
//! Console output by default, JSON lines when requested. `RUST_LOG` takes
//! precedence over the configured default filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,pgmux=debug";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Include file/line information
    pub include_location: bool,

    /// Default log level filter
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            include_location: cfg!(debug_assertions),
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn json() -> Self {
        Self {
            json: true,
            include_location: true,
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// reserved for command output.
pub fn init(config: LoggingConfig) -> anyhow::Result<()> {
    let layer = if config.json {
        fmt::layer()
            .with_target(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_filter(config.filter())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_file(config.include_location)
            .with_line_number(config.include_location)
            .with_writer(std::io::stderr)
            .with_filter(config.filter())
            .boxed()
    };

    tracing_subscriber::registry().with(layer).try_init()?;
    tracing::debug!(json = config.json, "logging initialized");
    Ok(())
}
