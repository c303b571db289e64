//! Backend services for zexport.
//!
//! This module contains the service layer:
//! - `session` - Record-server session traits and the supervised handle
//! - `supervisor` - Session lifecycle, liveness probing and reconnects
//! - `export` - Full export, snapshot commit and downstream push
//! - `storage` - SQLite snapshot store with atomic file writes
//! - `publisher` - Downstream delivery of the latest snapshot
//! - `yaz` - Sessions driven through the `yaz-client` tool

pub mod export;
pub mod publisher;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod yaz;

#[cfg(test)]
pub(crate) mod testing;

pub use export::ExportPipeline;
pub use publisher::{
    publisher_from_config, HttpUploadPublisher, NoopPublisher, SnapshotPublisher, SnapshotUpload,
};
pub use session::{ProbeOutcome, RecordSession, SessionConnector, SessionHandle};
pub use storage::SnapshotStore;
pub use supervisor::ConnectionSupervisor;
pub use yaz::YazClientConnector;
