//! Data models for zexport.
//!
//! - `session` - TargetConfig, SearchQuery, HealthState, SessionPhase
//! - `snapshot` - Record, Snapshot, ExportReport
//! - `config` - ServiceConfig and its parts

pub mod config;
pub mod session;
pub mod snapshot;

pub use config::{ExportOptions, PublisherConfig, ServiceConfig, ServiceConfigBuilder};
pub use session::{
    HealthState, QuerySyntax, SearchQuery, SessionOptions, SessionPhase, SupervisorStatus,
    TargetConfig,
};
pub use snapshot::{
    render_records, DownstreamStatus, ExportReport, Record, Snapshot, SnapshotDraft, SnapshotMeta,
};
