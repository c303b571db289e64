//! Error types for zexport.
//!
//! One variant per failure boundary: session open, probe, search, persist and
//! downstream push, plus the guards the export pipeline raises on its own.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for zexport.
#[derive(Debug, Error)]
pub enum ZexportError {
    /// Opening a session to the record server failed.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Liveness probe against an open session failed.
    #[error("Probe failed: {message}")]
    Probe {
        /// Human-readable error message.
        message: String,
        /// Session that was probed.
        session_id: Option<Uuid>,
    },

    /// No live session is available right now.
    #[error("No active connection to the record server: {message}")]
    ConnectionUnavailable {
        /// Human-readable error message.
        message: String,
    },

    /// The search call against the record server failed.
    #[error("Query failed: {message}")]
    QueryFailed {
        /// Human-readable error message.
        message: String,
        /// Session the query ran on.
        session_id: Option<Uuid>,
    },

    /// Another export is already running.
    #[error("Export already in progress")]
    ExportInProgress,

    /// Local durable storage failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Pushing the snapshot downstream failed.
    #[error("Downstream push failed: {message}")]
    Downstream {
        /// Human-readable error message.
        message: String,
        /// HTTP status returned by the downstream system, if any.
        status: Option<u16>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An operation exceeded its time budget.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Name of the operation that timed out.
        operation: String,
        /// Budget that was exceeded.
        seconds: u64,
    },

    /// Operation was cancelled because the service is shutting down.
    #[error("Cancelled: {message}")]
    Cancelled {
        /// Human-readable error message.
        message: String,
    },

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ZexportError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new probe error.
    pub fn probe(message: impl Into<String>, session_id: Option<Uuid>) -> Self {
        Self::Probe { message: message.into(), session_id }
    }

    /// Create a new unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ConnectionUnavailable { message: message.into() }
    }

    /// Create a new query error.
    pub fn query_failed(message: impl Into<String>, session_id: Option<Uuid>) -> Self {
        Self::QueryFailed { message: message.into(), session_id }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new storage error with source.
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage { message: message.into(), hint: None, source: Some(Box::new(source)) }
    }

    /// Create a new downstream error.
    pub fn downstream(message: impl Into<String>, status: Option<u16>) -> Self {
        Self::Downstream { message: message.into(), status, source: None }
    }

    /// Create a new timeout error.
    pub fn timeout(operation: impl Into<String>, budget: std::time::Duration) -> Self {
        Self::Timeout { operation: operation.into(), seconds: budget.as_secs() }
    }

    /// Create a new cancellation error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled { message: message.into() }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    // ========== Methods ==========

    /// Check if this error means the caller should simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. }
                | Self::QueryFailed { .. }
                | Self::ExportInProgress
                | Self::Timeout { .. }
        )
    }

    /// Check if this error represents a shutdown cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Probe { .. } => "Probe",
            Self::ConnectionUnavailable { .. } => "Connection",
            Self::QueryFailed { .. } => "Query",
            Self::ExportInProgress => "Export",
            Self::Storage { .. } => "Storage",
            Self::Downstream { .. } => "Downstream",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled { .. } => "Cancelled",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Stable machine-readable code used in HTTP error bodies.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection_failed",
            Self::Probe { .. } => "probe_failed",
            Self::ConnectionUnavailable { .. } => "connection_unavailable",
            Self::QueryFailed { .. } => "query_failed",
            Self::ExportInProgress => "export_in_progress",
            Self::Storage { .. } => "persist_failed",
            Self::Downstream { .. } => "downstream_push_failed",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }

    /// HTTP-equivalent status for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Connection { .. } | Self::Probe { .. } | Self::ConnectionUnavailable { .. } => {
                503
            }
            Self::QueryFailed { .. } => 500,
            Self::ExportInProgress => 409,
            Self::Storage { .. } => 500,
            Self::Downstream { .. } => 502,
            Self::Timeout { .. } => 504,
            Self::Cancelled { .. } => 503,
            Self::Config { .. } | Self::Internal { .. } => 500,
        }
    }

    /// Get actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { .. } => Some("Check that the record server is reachable"),
            Self::Probe { .. } => None,
            Self::ConnectionUnavailable { .. } => {
                Some("The session is being re-established, try again later")
            }
            Self::QueryFailed { .. } => Some("A reconnect has been scheduled, try again later"),
            Self::ExportInProgress => Some("Wait for the running export to finish"),
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Downstream { .. } => Some("The snapshot was saved locally; check the upload URL"),
            Self::Timeout { .. } => Some("Increase the timeout or try again later"),
            Self::Cancelled { .. } => None,
            Self::Config { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Convert to operator-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::QueryFailed { session_id: Some(id), .. }
            | Self::Probe { session_id: Some(id), .. } => Some(format!("Session: {id}")),
            Self::Downstream { status: Some(status), .. } => Some(format!("HTTP status: {status}")),
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// Operator-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connection Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for logs and error bodies.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from rusqlite::Error to ZexportError.
impl From<rusqlite::Error> for ZexportError {
    fn from(err: rusqlite::Error) -> Self {
        ZexportError::Storage {
            message: err.to_string(),
            hint: Some("The snapshot database may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from std::io::Error to ZexportError.
impl From<std::io::Error> for ZexportError {
    fn from(err: std::io::Error) -> Self {
        ZexportError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to ZexportError.
impl From<serde_json::Error> for ZexportError {
    fn from(err: serde_json::Error) -> Self {
        ZexportError::Storage {
            message: format!("JSON error: {err}"),
            hint: Some("Data may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from reqwest::Error to ZexportError.
impl From<reqwest::Error> for ZexportError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let message = if err.is_timeout() {
            "Request to downstream timed out".to_string()
        } else if err.is_connect() {
            format!("Could not reach downstream: {err}")
        } else {
            err.to_string()
        };
        ZexportError::Downstream { message, status, source: Some(Box::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(ZexportError::unavailable("down").status_code(), 503);
        assert_eq!(ZexportError::query_failed("boom", None).status_code(), 500);
        assert_eq!(ZexportError::downstream("refused", None).status_code(), 502);
        assert_eq!(ZexportError::ExportInProgress.status_code(), 409);
        assert_eq!(ZexportError::storage("disk full", None).status_code(), 500);
    }

    #[test]
    fn test_transient_errors() {
        assert!(ZexportError::unavailable("down").is_transient());
        assert!(ZexportError::ExportInProgress.is_transient());
        assert!(!ZexportError::storage("disk full", None).is_transient());
        assert!(!ZexportError::downstream("refused", None).is_transient());
    }

    #[test]
    fn test_error_info_carries_session() {
        let id = Uuid::new_v4();
        let info = ZexportError::query_failed("socket closed", Some(id)).to_error_info();
        assert_eq!(info.error_type, "Query Error");
        assert!(info.message.contains("socket closed"));
        assert_eq!(info.technical_detail, Some(format!("Session: {id}")));
        assert!(info.hint.is_some());
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let err: ZexportError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err.error_code(), "persist_failed");
        assert_eq!(err.hint(), Some("Check file permissions and disk space"));
    }
}
