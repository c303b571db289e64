//! Core types and services for the zexport record exporter.
//!
//! This crate keeps one long-lived session to a Z39.50 record server and
//! turns on-demand full exports into durable snapshots:
//!
//! - **error**: Error taxonomy with HTTP status mapping
//! - **models**: Target, query, snapshot and configuration types
//! - **services**: Session supervision, export pipeline, storage, delivery
//! - **state**: Service wiring and lifecycle
//! - **logging**: Structured logging setup

pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;


pub use error::{ErrorInfo, ZexportError};
pub use models::{
    DownstreamStatus, ExportReport, HealthState, QuerySyntax, Record, SearchQuery, ServiceConfig,
    SessionOptions, SessionPhase, Snapshot, SnapshotMeta, SupervisorStatus, TargetConfig,
};
pub use services::{
    ConnectionSupervisor, ExportPipeline, SessionConnector, SnapshotPublisher, SnapshotStore,
    YazClientConnector,
};
pub use state::ZexportState;
