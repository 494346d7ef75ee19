//! Structured logging for the pipeline.
//!
//! Initialise once at startup with [`init_logging`]. `RUST_LOG` overrides the
//! configured level. Output goes to stderr in `pretty` or `json` format and,
//! when `file_dir` is set, to a daily-rolling file as well.
//!
//! Field names used consistently in spans and events:
//! - `job`: scheduled job name
//! - `bug_code`, `bug_id`: bug registry identifiers
//! - `event_id`, `topic`: outbox identifiers
//! - `suggestion_id`: fix suggestion identifier

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

const LOG_FILE_PREFIX: &str = "selfheal.log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive (trace, debug, info, warn, error or a full
    /// `EnvFilter` string).
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rolling log files; stderr only when unset.
    #[serde(default)]
    pub file_dir: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Pretty,
            file_dir: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level '{level}': {message}")]
    InvalidLevel { level: String, message: String },

    #[error("failed to create log directory: {0}")]
    CreateDir(#[from] std::io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// `RUST_LOG` when present and valid, otherwise the configured level.
fn build_filter(level: &str) -> Result<EnvFilter, LogError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|e| LogError::InvalidLevel {
        level: level.to_string(),
        message: e.to_string(),
    })
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn file_layer(format: LogFormat, dir: &std::path::Path) -> Result<(BoxedLayer, WorkerGuard), LogError> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = match format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .flatten_event(true)
            .boxed(),
    };
    Ok((layer, guard))
}

/// Install the global subscriber.
///
/// `verbose` raises the configured level to `debug`. The returned guard
/// flushes the file writer on drop and must be held for the process lifetime.
pub fn init_logging(config: &LogConfig, verbose: bool) -> Result<Option<WorkerGuard>, LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let level = if verbose { "debug" } else { config.level.as_str() };
    let mut layers: Vec<BoxedLayer> = vec![build_filter(level)?.boxed(), stderr_layer(config.format)];

    let guard = match &config.file_dir {
        Some(dir) => {
            let (layer, guard) = file_layer(config.format, dir)?;
            layers.push(layer);
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry().with(layers).try_init()?;
    let _ = LOGGING_INITIALIZED.set(true);

    tracing::debug!(
        log_level = %level,
        log_format = %config.format,
        log_dir = ?config.file_dir,
        "logging initialized"
    );
    Ok(guard)
}

pub fn is_logging_initialized() -> bool {
    LOGGING_INITIALIZED.get().is_some()
}
