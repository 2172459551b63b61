//! Tracing setup.
//!
//! Console output in one of three formats, plus an optional plain-text log
//! file kept next to the run output. `RUST_LOG` overrides the configured level.
//!
//! # Example
//! ```no_run
//! use sonorover::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracingConfig::new(Level::DEBUG)
//!     .with_format(OutputFormat::Json)
//!     .with_log_file("data/log_20250101_120000_scan.txt");
//! logging::init(config)?;
//! # Ok(())
//! # }
//! ```

use std::fs::{self, File};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::ApplicationConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (for development)
    Pretty,
    /// Single-line (for operation)
    Compact,
    /// JSON lines (for log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Console format
    pub format: OutputFormat,
    /// Whether to include span open/close events
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to enable ANSI colors (Pretty only)
    pub with_ansi: bool,
    /// Additional plain-text log file
    pub log_file: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
            log_file: None,
        }
    }
}

impl TracingConfig {
    /// Build from the `[application]` config section.
    pub fn from_app_config(config: &ApplicationConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.log_level)?,
            format: config.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Config with the given level and defaults otherwise
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set console format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Also write events to `path`
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Install the global subscriber.
///
/// Idempotent: if a subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())` and leaves it in place.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let console: BoxedLayer = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter(config.level))
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter(config.level))
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter(config.level))
            .boxed(),
    };
    let mut layers = vec![console];

    if let Some(path) = &config.log_file {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create log directory {}: {}", parent.display(), e))?;
        }
        let file = File::create(path)
            .map_err(|e| format!("Failed to create log file {}: {}", path.display(), e))?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file))
                .with_filter(env_filter(config.level))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .or_else(|e| {
            // tests and embedding applications may have installed one already
            if e.to_string().contains("a global default trace dispatcher has already been set") {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(level)))
}

/// Parse a log level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
    .to_string()
}
