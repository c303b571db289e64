//! Record-server target, query and session health models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Supervisor's belief about the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Nothing has been attempted yet
    #[default]
    Unknown,
    /// Last connect or probe succeeded
    Alive,
    /// Last connect, probe or search failed
    Dead,
}

impl HealthState {
    /// Check if the session may be handed out.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Alive => "alive",
            Self::Dead => "dead",
        }
    }
}

/// Lifecycle of the supervised session.
///
/// `NoSession -> Alive` on a successful open, `Alive -> Dead` on a failed
/// probe or search, `Dead -> Reconnecting -> Alive | Dead` on every reconnect
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session object exists
    #[default]
    NoSession,
    /// A session exists and is believed usable
    Alive,
    /// The session failed and has not been replaced yet
    Dead,
    /// A close-and-reopen sequence is running
    Reconnecting,
}

impl SessionPhase {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::Alive => "alive",
            Self::Dead => "dead",
            Self::Reconnecting => "reconnecting",
        }
    }
}

/// Query language understood by the record server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySyntax {
    /// Common Command Language
    #[default]
    Ccl,
    /// YAZ prefix (RPN) notation
    Prefix,
    /// Contextual Query Language
    Cql,
}

impl QuerySyntax {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ccl => "ccl",
            Self::Prefix => "prefix",
            Self::Cql => "cql",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prefix" | "rpn" | "pqf" => Self::Prefix,
            "cql" => Self::Cql,
            _ => Self::Ccl,
        }
    }
}

/// A search issued against a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Query language
    pub syntax: QuerySyntax,
    /// Query text
    pub text: String,
    /// Maximum number of records to retrieve (None = all hits)
    pub limit: Option<usize>,
}

impl SearchQuery {
    /// Query matching every record in the database.
    pub const MATCH_ALL: &'static str = "1=1";

    /// Create a new unrestricted query.
    pub fn new(syntax: QuerySyntax, text: impl Into<String>) -> Self {
        Self { syntax, text: text.into(), limit: None }
    }

    /// The default "fetch everything" query.
    pub fn all() -> Self {
        Self::new(QuerySyntax::Ccl, Self::MATCH_ALL)
    }

    /// Minimal liveness query derived from this one.
    pub fn probe(&self) -> Self {
        self.clone().with_limit(1)
    }

    /// Cap the number of retrieved records.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self::all()
    }
}

/// Timeouts and cadence of the supervised session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Budget for opening a session (the server is slow to accept)
    pub connect_timeout_secs: u64,
    /// Budget for one liveness probe
    pub probe_timeout_secs: u64,
    /// Budget for one full export search
    pub search_timeout_secs: u64,
    /// Delay between probe ticks
    pub probe_interval_secs: u64,
    /// Budget for closing a session
    pub close_timeout_secs: u64,
}

impl SessionOptions {
    /// Connect budget as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Probe budget as a Duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Search budget as a Duration.
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    /// Probe interval as a Duration.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Close budget as a Duration.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 300,
            probe_timeout_secs: 30,
            search_timeout_secs: 1800,
            probe_interval_secs: 600,
            close_timeout_secs: 10,
        }
    }
}

/// Where the record server lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Server hostname or IP
    pub host: String,
    /// Server port (default 210)
    pub port: u16,
    /// Database name on the server
    pub database: String,
    /// Timeouts and probe cadence
    pub options: SessionOptions,
}

impl TargetConfig {
    /// Default Z39.50 port.
    pub const DEFAULT_PORT: u16 = 210;

    /// Create a new target with default options.
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: if port == 0 { Self::DEFAULT_PORT } else { port },
            database: database.into(),
            options: SessionOptions::default(),
        }
    }

    /// Set session options.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Validate the target.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("Host is required".to_string());
        }
        if self.database.is_empty() {
            return Err("Database name is required".to_string());
        }
        if self.options.probe_interval_secs == 0 {
            return Err("Probe interval must be at least one second".to_string());
        }
        if self.options.connect_timeout_secs == 0
            || self.options.probe_timeout_secs == 0
            || self.options.search_timeout_secs == 0
        {
            return Err("Timeouts must be at least one second".to_string());
        }
        Ok(())
    }

    /// Get the display address (`host:port/database`).
    pub fn display_url(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Point-in-time view of the supervisor, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// Current lifecycle phase
    pub phase: SessionPhase,
    /// Current liveness belief
    pub health: HealthState,
    /// Identifier of the open session, if any
    pub session_id: Option<Uuid>,
    /// When the open session was established
    pub connected_at: Option<DateTime<Utc>>,
    /// When the last probe tick finished
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Message of the last connect, probe or search failure
    pub last_error: Option<String>,
    /// Number of reconnect attempts since start
    pub reconnect_attempts: u64,
    /// Target address
    pub target: String,
}
