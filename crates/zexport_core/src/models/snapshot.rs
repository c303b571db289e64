//! Record, snapshot and export outcome models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator placed between records in the rendered snapshot text.
pub const RECORD_SEPARATOR: &str = "\n\n";

/// A single raw record returned by a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    data: String,
}

impl Record {
    /// Wrap raw record content.
    pub fn new(data: impl Into<String>) -> Self {
        Self { data: data.into() }
    }

    /// Raw record content.
    pub fn data(&self) -> &str {
        &self.data
    }
}

impl From<String> for Record {
    fn from(data: String) -> Self {
        Self { data }
    }
}

impl From<&str> for Record {
    fn from(data: &str) -> Self {
        Self { data: data.to_string() }
    }
}

/// Render records the way they are written to disk and pushed downstream.
pub fn render_records(records: &[Record]) -> String {
    records.iter().map(Record::data).collect::<Vec<_>>().join(RECORD_SEPARATOR)
}

/// Records fetched by one export, not yet committed.
#[derive(Debug, Clone)]
pub struct SnapshotDraft {
    /// Records in query order
    pub records: Vec<Record>,
    /// When the fetch completed
    pub created_at: DateTime<Utc>,
}

impl SnapshotDraft {
    /// Create a draft stamped with the current time.
    pub fn new(records: Vec<Record>) -> Self {
        Self { records, created_at: Utc::now() }
    }

    /// Number of records in the draft.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// One committed, immutable export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonically increasing sequence id
    pub id: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Name of the timestamped dump file
    pub file_name: String,
    /// Records in query order
    pub records: Vec<Record>,
}

impl Snapshot {
    /// Number of records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Rendered text content.
    pub fn content(&self) -> String {
        render_records(&self.records)
    }
}

/// Snapshot listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Sequence id
    pub id: i64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Name of the timestamped dump file
    pub file_name: String,
    /// Number of records
    pub record_count: usize,
}

/// Outcome of pushing the latest snapshot downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DownstreamStatus {
    /// Downstream accepted the upload
    Delivered,
    /// No downstream is configured
    Skipped,
    /// Upload failed; the snapshot stays committed locally
    Failed {
        /// Failure description
        error: String,
    },
}

impl DownstreamStatus {
    /// Check if the push failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Successful export outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    /// Committed snapshot id
    pub snapshot_id: i64,
    /// Number of records exported
    pub count: usize,
    /// Name of the timestamped dump file
    pub saved: String,
    /// Downstream delivery outcome
    pub downstream: DownstreamStatus,
    /// Wall time of the export in milliseconds
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_joins_with_blank_line() {
        let records = vec![Record::new("first"), Record::new("second"), Record::new("third")];
        assert_eq!(render_records(&records), "first\n\nsecond\n\nthird");
        assert_eq!(render_records(&[]), "");
    }

    #[test]
    fn test_record_serializes_as_plain_string() {
        let json = serde_json::to_string(&vec![Record::new("a"), Record::new("b")]).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
    }

    #[test]
    fn test_downstream_status_serialization() {
        let failed = DownstreamStatus::Failed { error: "refused".into() };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "refused");
        assert_eq!(serde_json::to_value(DownstreamStatus::Skipped).unwrap()["status"], "skipped");
    }
}
