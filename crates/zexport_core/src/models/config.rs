//! Service configuration models.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{QuerySyntax, SearchQuery, SessionOptions, TargetConfig};
use crate::logging::LOGS_DIR;
use crate::services::storage::{DATABASE_FILE, DUMPS_DIR};

/// Where and how the latest snapshot is pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Upload endpoint (None = push disabled)
    pub upload_url: Option<String>,
    /// Budget for one upload
    pub push_timeout_secs: u64,
}

impl PublisherConfig {
    /// Push budget as a Duration.
    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { upload_url: None, push_timeout_secs: 60 }
    }
}

/// Export behaviour and on-disk naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    /// The "fetch everything" query
    pub query: SearchQuery,
    /// Name of the canonical latest file in the data directory
    pub current_file_name: String,
    /// Prefix of the timestamped dump files
    pub dump_prefix: String,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            query: SearchQuery::all(),
            current_file_name: "current.txt".to_string(),
            dump_prefix: "data".to_string(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Record server
    pub target: TargetConfig,
    /// Export behaviour
    pub export: ExportOptions,
    /// Downstream delivery
    pub publisher: PublisherConfig,
    /// Data directory for the database, dumps and logs
    pub data_dir: PathBuf,
    /// Path or name of the yaz-client executable
    pub yaz_client: PathBuf,
    /// Records fetched per `show` command
    pub fetch_batch_size: usize,
}

impl ServiceConfig {
    /// Create a configuration with defaults for everything but the target.
    pub fn new(target: TargetConfig) -> Self {
        Self {
            target,
            export: ExportOptions::default(),
            publisher: PublisherConfig::default(),
            data_dir: crate::services::storage::default_data_dir(),
            yaz_client: PathBuf::from("yaz-client"),
            fetch_batch_size: crate::services::yaz::DEFAULT_BATCH_SIZE,
        }
    }

    /// Create a builder.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.target.validate()?;
        if self.export.query.text.trim().is_empty() {
            return Err("Export query must not be empty".to_string());
        }
        validate_current_file_name(&self.export.current_file_name)?;
        if self.export.dump_prefix.contains('/') || self.export.dump_prefix.contains('\\') {
            return Err("Dump prefix must not contain path separators".to_string());
        }
        if let Some(ref url) = self.publisher.upload_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Upload URL must be an http(s) URL".to_string());
            }
        }
        if self.publisher.push_timeout_secs == 0 {
            return Err("Push timeout must be at least one second".to_string());
        }
        if self.fetch_batch_size == 0 {
            return Err("Fetch batch size must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Names the data directory already uses for its own entries.
const RESERVED_NAMES: &[&str] = &[".", "..", DUMPS_DIR, LOGS_DIR, DATABASE_FILE];

fn validate_current_file_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() || name.contains('/') || name.contains('\\') {
        return Err("Current file name must be a plain file name".to_string());
    }
    let lower = name.to_ascii_lowercase();
    if RESERVED_NAMES.contains(&lower.as_str()) || lower.starts_with(&format!("{DATABASE_FILE}-")) {
        return Err(format!("Current file name '{name}' is reserved inside the data directory"));
    }
    if Path::new(&lower).extension().is_some_and(|ext| ext == "tmp") {
        return Err("Current file name must not use the .tmp extension".to_string());
    }
    Ok(())
}

/// Builder for ServiceConfig.
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    host: Option<String>,
    port: u16,
    database: Option<String>,
    session: SessionOptions,
    query_syntax: QuerySyntax,
    query_text: Option<String>,
    current_file_name: Option<String>,
    dump_prefix: Option<String>,
    upload_url: Option<String>,
    push_timeout_secs: Option<u64>,
    data_dir: Option<PathBuf>,
    yaz_client: Option<PathBuf>,
    fetch_batch_size: Option<usize>,
}

impl ServiceConfigBuilder {
    /// Set the record server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the record server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set session timeouts and probe cadence.
    pub fn session_options(mut self, options: SessionOptions) -> Self {
        self.session = options;
        self
    }

    /// Set the export query.
    pub fn query(mut self, syntax: QuerySyntax, text: impl Into<String>) -> Self {
        self.query_syntax = syntax;
        self.query_text = Some(text.into());
        self
    }

    /// Set the canonical latest file name.
    pub fn current_file_name(mut self, name: impl Into<String>) -> Self {
        self.current_file_name = Some(name.into());
        self
    }

    /// Set the dump file prefix.
    pub fn dump_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dump_prefix = Some(prefix.into());
        self
    }

    /// Set the downstream upload URL.
    pub fn upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }

    /// Set the push timeout.
    pub fn push_timeout_secs(mut self, secs: u64) -> Self {
        self.push_timeout_secs = Some(secs);
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Set the yaz-client executable.
    pub fn yaz_client(mut self, program: impl Into<PathBuf>) -> Self {
        self.yaz_client = Some(program.into());
        self
    }

    /// Set how many records each `show` command fetches.
    pub fn fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = Some(size);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<ServiceConfig, String> {
        let target = TargetConfig::new(
            self.host.ok_or("Host is required")?,
            self.port,
            self.database.ok_or("Database is required")?,
        )
        .with_options(self.session);

        let mut config = ServiceConfig::new(target);
        if let Some(text) = self.query_text {
            config.export.query = SearchQuery::new(self.query_syntax, text);
        }
        if let Some(name) = self.current_file_name {
            config.export.current_file_name = name;
        }
        if let Some(prefix) = self.dump_prefix {
            config.export.dump_prefix = prefix;
        }
        config.publisher.upload_url = self.upload_url.filter(|u| !u.is_empty());
        if let Some(secs) = self.push_timeout_secs {
            config.publisher.push_timeout_secs = secs;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(program) = self.yaz_client {
            config.yaz_client = program;
        }
        if let Some(size) = self.fetch_batch_size {
            config.fetch_batch_size = size;
        }

        config.validate()?;
        Ok(config)
    }
}
