//! Full export: fetch everything, commit a snapshot, push it downstream.

use crate::error::ZexportError;
use crate::models::{DownstreamStatus, ExportReport, SearchQuery, Snapshot, SnapshotDraft};
use crate::services::publisher::{SnapshotPublisher, SnapshotUpload};
use crate::services::storage::SnapshotStore;
use crate::services::supervisor::ConnectionSupervisor;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Runs exports against the supervised session.
///
/// At most one export is in flight; a concurrent request is rejected rather
/// than queued. The pipeline never closes or replaces the session itself.
pub struct ExportPipeline {
    supervisor: Arc<ConnectionSupervisor>,
    store: Arc<SnapshotStore>,
    publisher: Arc<dyn SnapshotPublisher>,
    query: SearchQuery,
    upload_file_name: String,
    push_timeout: Duration,
    in_flight: Mutex<()>,
    shutdown: CancellationToken,
}

impl ExportPipeline {
    /// Create a pipeline. Cancelling `shutdown` aborts a running export.
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        store: Arc<SnapshotStore>,
        publisher: Arc<dyn SnapshotPublisher>,
        query: SearchQuery,
        push_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let upload_file_name = store
            .current_file_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "current.txt".to_string());

        Self {
            supervisor,
            store,
            publisher,
            query,
            upload_file_name,
            push_timeout,
            in_flight: Mutex::new(()),
            shutdown,
        }
    }

    /// Check if an export is currently running.
    pub fn is_running(&self) -> bool {
        self.in_flight.try_lock().is_err()
    }

    /// Produce one snapshot from a full fetch and push it downstream.
    pub async fn run_export(&self) -> Result<ExportReport, ZexportError> {
        let Ok(_in_flight) = self.in_flight.try_lock() else {
            tracing::debug!("Export requested while another is running");
            return Err(ZexportError::ExportInProgress);
        };

        if self.shutdown.is_cancelled() {
            return Err(ZexportError::cancelled("Service is shutting down"));
        }

        let started = Instant::now();
        let session = self.supervisor.acquire()?;
        let budget = self.supervisor.target().options.search_timeout();

        tracing::info!(session_id = %session.id(), query = %self.query.text, "Export started");

        let fetched = tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::warn!(session_id = %session.id(), "Export aborted by shutdown");
                return Err(ZexportError::cancelled("Export aborted by shutdown"));
            }
            fetched = session.search(&self.query, budget) => fetched,
        };

        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                self.supervisor.report_failure(session.id(), &e.to_string());
                return Err(e);
            }
        };
        drop(session);

        let snapshot = self.persist(SnapshotDraft::new(records)).await?;
        let downstream = self.push(&snapshot).await;

        let report = ExportReport {
            snapshot_id: snapshot.id,
            count: snapshot.record_count(),
            saved: snapshot.file_name,
            downstream,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            snapshot_id = report.snapshot_id,
            count = report.count,
            elapsed_ms = report.elapsed_ms,
            downstream_failed = report.downstream.is_failed(),
            "Export finished"
        );
        Ok(report)
    }

    async fn persist(&self, draft: SnapshotDraft) -> Result<Snapshot, ZexportError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.commit(&draft))
            .await
            .map_err(|e| ZexportError::internal(format!("Persist task failed: {e}")))?
    }

    async fn push(&self, snapshot: &Snapshot) -> DownstreamStatus {
        if !self.publisher.is_enabled() {
            return DownstreamStatus::Skipped;
        }

        let upload = SnapshotUpload {
            snapshot_id: snapshot.id,
            file_name: self.upload_file_name.clone(),
            content: snapshot.content(),
        };

        let result = match tokio::time::timeout(self.push_timeout, self.publisher.publish(&upload))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ZexportError::timeout("Downstream push", self.push_timeout)),
        };

        match result {
            Ok(()) => DownstreamStatus::Delivered,
            Err(e) => {
                tracing::warn!(snapshot_id = snapshot.id, error = %e, "Downstream push failed");
                DownstreamStatus::Failed { error: e.to_string() }
            }
        }
    }
}
