//! Logging module for the quality governor daemon.
//!
//! This module configures tracing with JSON format output to both stderr
//! and a rotating log file under the user data directory
//! (`~/.local/share/quality-governor/logs` on Linux).

use crate::error::LoggingError;
use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};
use time::format_description::well_known::Rfc3339;

/// Application directory under the user data dir
const APP_DIR: &str = "quality-governor";
/// Log file prefix
const LOG_FILE_PREFIX: &str = "governor";
/// Maximum number of log files to retain
const MAX_LOG_FILES: usize = 3;

/// Initialize the logging system with both stderr and file output.
///
/// Logs are written in JSON format to stderr and to a daily-rotating file,
/// keeping the last 3 files. `RUST_LOG` overrides the default `info` level.
pub fn init_logging() -> Result<LogGuard, LoggingError> {
    init_logging_in(&log_directory()?)
}

/// Same as [`init_logging`] with an explicit log directory.
pub fn init_logging_in(log_dir: &Path) -> Result<LogGuard, LoggingError> {
    std::fs::create_dir_all(log_dir).map_err(|e| LoggingError::DirectoryCreationFailed {
        path: log_dir.display().to_string(),
        source: e,
    })?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(log_dir)
        .map_err(|e| LoggingError::AppenderCreationFailed(e.to_string()))?;

    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // File output carries thread and source location, stderr stays lean
    let file_layer = json_layer(non_blocking_file)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);
    let stderr_layer = json_layer(non_blocking_stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| LoggingError::AppenderCreationFailed(e.to_string()))?;

    Ok(LogGuard {
        _file_guard: file_guard,
        _stderr_guard: stderr_guard,
    })
}

type JsonFormat = fmt::format::Format<fmt::format::Json, UtcTime<Rfc3339>>;

/// JSON formatting layer shared by every output.
fn json_layer<S, W>(writer: W) -> fmt::Layer<S, fmt::format::JsonFields, JsonFormat, W>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_writer(writer)
}

/// Log directory under the platform data dir.
pub fn log_directory() -> Result<PathBuf, LoggingError> {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR).join("logs"))
        .ok_or(LoggingError::DirectoryNotFound)
}

/// Guard that keeps the non-blocking writers alive.
/// Must be held for the lifetime of the application.
pub struct LogGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
    _stderr_guard: tracing_appender::non_blocking::WorkerGuard,
}

/// One parsed JSON log line.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// Severity level (ERROR, WARN, INFO, DEBUG, TRACE)
    pub level: String,
    pub message: String,
    /// Module path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Structured event fields other than the message
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogEntry {
    /// An entry is valid when it has a timestamp, a known level and a message.
    pub fn is_valid(&self) -> bool {
        !self.message.is_empty()
            && time::OffsetDateTime::parse(&self.timestamp, &Rfc3339).is_ok()
            && matches!(
                self.level.to_uppercase().as_str(),
                "ERROR" | "WARN" | "INFO" | "DEBUG" | "TRACE"
            )
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

/// Parse a line written by the JSON layer.
pub fn parse_log_entry(json_line: &str) -> Result<LogEntry, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(json_line)?;

    let text = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    let mut fields = value
        .get("fields")
        .and_then(|f| f.as_object())
        .cloned()
        .unwrap_or_default();
    let message = fields
        .remove("message")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    Ok(LogEntry {
        timestamp: text("timestamp"),
        level: text("level"),
        message,
        target: value.get("target").and_then(|v| v.as_str()).map(str::to_string),
        fields,
    })
}
