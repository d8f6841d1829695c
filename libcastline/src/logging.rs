//! Logging setup shared by the Castline binaries
//!
//! All output goes to stderr so that `cast-queue --format json` stays
//! pipeable. Format and level come from flags or from `CASTLINE_LOG_FORMAT`
//! and `CASTLINE_LOG_LEVEL`; `RUST_LOG` still wins when set.
//!
//! ```no_run
//! use libcastline::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::new(LogFormat::Json, "info".to_string(), false).init();
//! ```

use std::str::FromStr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain lines without colors
    Text,
    /// One JSON object per line
    Json,
    /// Multi-line, colored
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                other
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    /// Raise castline crates to `debug` regardless of `level`
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
        }
    }

    /// Read `CASTLINE_LOG_FORMAT` and `CASTLINE_LOG_LEVEL`, defaulting to
    /// text at `info`. An unknown format falls back to text.
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var("CASTLINE_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let level = std::env::var("CASTLINE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        Self::new(format, level, verbose)
    }

    /// Filter directives this configuration resolves to (ignoring `RUST_LOG`)
    pub fn directives(&self) -> String {
        if self.verbose {
            format!("{},libcastline=debug,cast_send=debug,cast_queue=debug", self.level)
        } else {
            self.level.clone()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directives()))
    }

    /// Install the global subscriber.
    ///
    /// Returns `false` if a subscriber was already installed (e.g. by an
    /// earlier test in the same process).
    pub fn init(&self) -> bool {
        let filter = self.filter();

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_line_number(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false)
                .try_init(),
        };

        result.is_ok()
    }
}

/// Initialize logging from the environment
pub fn init_default() -> bool {
    LoggingConfig::from_env(false).init()
}
