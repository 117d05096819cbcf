//! Logging setup using the tracing ecosystem.
//!
//! The library itself only emits `tracing` events; binaries and demos call
//! [`init_logging`] once at startup.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::error::{GroundlinkError, Result};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "GROUNDLINK_LOG";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g., "info", "groundlink=debug,tokio=warn")
    pub filter: String,
    /// Include span events (enter/exit)
    pub span_events: bool,
    /// Include file/line in logs
    pub file_line: bool,
    /// Include the event target
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            span_events: false,
            file_line: false,
            target: true,
        }
    }
}

impl LogConfig {
    /// Filter from `GROUNDLINK_LOG`, defaulting to "info".
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var(LOG_ENV).unwrap_or_else(|_| "info".into()),
            ..Self::default()
        }
    }

    /// Verbose output for development.
    pub fn development() -> Self {
        Self {
            filter: "debug".into(),
            span_events: true,
            file_line: true,
            target: true,
        }
    }
}

/// Initialize stderr logging.
///
/// # Errors
///
/// `Config` if the filter does not parse or a global subscriber is
/// already installed.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter)
        .map_err(|e| GroundlinkError::Config(format!("Invalid log filter: {}", e)))?;

    let fmt_layer = fmt::layer()
        .with_target(config.target)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(config.file_line)
        .with_line_number(config.file_line)
        .with_span_events(if config.span_events {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        })
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| GroundlinkError::Config(format!("Failed to init logging: {}", e)))
}
