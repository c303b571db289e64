//! Structured logging for the service process.
//!
//! Console output goes to stderr, colored only when stderr is a terminal.
//! A daily rotating file under `<data_dir>/logs` receives the same events
//! unless the process runs console-only. Either sink can emit plain text or
//! one JSON object per line. The filter comes from, in order, an explicit
//! filter, `ZEXPORT_LOG`, `RUST_LOG`, then the build default.

use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Subdirectory of the data directory holding log files.
pub const LOGS_DIR: &str = "logs";

/// Line format for every sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Parse a format name.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("Unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory for rotating log files (None = console only)
    pub log_dir: Option<PathBuf>,
    /// Line format
    pub format: LogFormat,
    /// Color console output
    pub ansi: bool,
    /// Optional explicit filter
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Log to the console and to rotating files in `log_dir`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir: Some(log_dir),
            format: LogFormat::Text,
            ansi: atty::is(atty::Stream::Stderr),
            log_filter: None,
        }
    }

    /// Set an explicit filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Set the line format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Skip the file sink.
    pub fn console_only(mut self) -> Self {
        self.log_dir = None;
        self
    }
}

/// Guard that must be held for the lifetime of the process.
///
/// Dropping this guard flushes pending file log entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// A file sink that cannot be created is reported on stderr and skipped.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let filter = build_env_filter(config.log_filter.as_deref());

    let (file_writer, worker_guard) = match config.log_dir.as_deref().map(file_writer) {
        Some(Ok((writer, guard))) => (Some(writer), Some(guard)),
        Some(Err(e)) => {
            eprintln!("Warning: file logging disabled: {e}");
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(format_layer(std::io::stderr, config.format, config.ansi))
        .with(file_writer.map(|writer| format_layer(writer, config.format, false)))
        .init();

    LoggingGuard { _worker_guard: worker_guard }
}

fn file_writer(log_dir: &Path) -> Result<(NonBlocking, WorkerGuard), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("zexport")
        .filename_suffix("log")
        .build(log_dir)?;

    Ok(tracing_appender::non_blocking(appender))
}

fn format_layer<S, W>(writer: W, format: LogFormat, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi).with_target(true);
    match format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env("ZEXPORT_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Default filter for the build type.
///
/// Request spans from the HTTP layer stay visible in release builds.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "info,zexport=debug,zexport_core=debug,tower_http=debug,hyper=warn,reqwest=warn,rusqlite=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "warn,zexport=info,zexport_core=info,tower_http=info"
    }
}

/// Log directory inside a data directory.
pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LOGS_DIR)
}
