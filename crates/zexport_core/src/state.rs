//! Service state and lifecycle.
//!
//! Wires the snapshot store, connection supervisor and export pipeline
//! together and owns the process-wide shutdown token. Shared by every HTTP
//! handler through an `Arc`.

use crate::error::ZexportError;
use crate::models::{ExportReport, HealthState, ServiceConfig, Snapshot, SnapshotMeta, SupervisorStatus};
use crate::services::publisher::{publisher_from_config, SnapshotPublisher};
use crate::services::session::SessionConnector;
use crate::services::storage::SnapshotStore;
use crate::services::supervisor::ConnectionSupervisor;
use crate::services::yaz::YazClientConnector;
use crate::services::ExportPipeline;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Central service state.
pub struct ZexportState {
    /// Validated configuration
    config: ServiceConfig,
    /// Durable snapshot store
    store: Arc<SnapshotStore>,
    /// Session owner
    supervisor: Arc<ConnectionSupervisor>,
    /// Export runner
    pipeline: ExportPipeline,
    /// Cancelled on shutdown
    shutdown: CancellationToken,
}

impl ZexportState {
    /// Start the service with the `yaz-client` connector and the configured publisher.
    pub async fn from_config(config: ServiceConfig) -> Result<Self, ZexportError> {
        let connector = Arc::new(
            YazClientConnector::new(config.yaz_client.clone()).with_batch_size(config.fetch_batch_size),
        );
        let publisher = publisher_from_config(&config.publisher)?;
        Self::start(config, connector, publisher).await
    }

    /// Open the store and make the initial connect.
    ///
    /// An unreachable record server does not fail startup; the service comes
    /// up with health Dead and the probe loop keeps trying.
    pub async fn start(
        config: ServiceConfig,
        connector: Arc<dyn SessionConnector>,
        publisher: Arc<dyn SnapshotPublisher>,
    ) -> Result<Self, ZexportError> {
        config.validate().map_err(ZexportError::config)?;

        let data_dir = config.data_dir.clone();
        let export = config.export.clone();
        let store = tokio::task::spawn_blocking(move || SnapshotStore::open(data_dir, &export))
            .await
            .map_err(|e| ZexportError::internal(format!("Store open task failed: {e}")))??;
        let store = Arc::new(store);

        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.target.clone(),
            connector,
            config.export.query.clone(),
        ));
        let shutdown = supervisor.shutdown_token();

        let pipeline = ExportPipeline::new(
            supervisor.clone(),
            store.clone(),
            publisher,
            config.export.query.clone(),
            config.publisher.push_timeout(),
            shutdown.clone(),
        );

        let health = supervisor.start().await;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            target = %config.target.display_url(),
            health = health.as_str(),
            "Service state initialized"
        );

        Ok(Self { config, store, supervisor, pipeline, shutdown })
    }

    /// Get the configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Run one export.
    pub async fn export(&self) -> Result<ExportReport, ZexportError> {
        self.pipeline.run_export().await
    }

    /// Current liveness belief.
    pub fn health(&self) -> HealthState {
        self.supervisor.health()
    }

    /// Supervisor status snapshot.
    pub fn status(&self) -> SupervisorStatus {
        self.supervisor.status()
    }

    /// Load the latest committed snapshot.
    pub async fn latest_snapshot(&self) -> Result<Option<Snapshot>, ZexportError> {
        self.with_store(|store| store.read_latest()).await
    }

    /// Load a snapshot by id.
    pub async fn snapshot(&self, id: i64) -> Result<Option<Snapshot>, ZexportError> {
        self.with_store(move |store| store.get(id)).await
    }

    /// List snapshot metadata, newest first.
    pub async fn list_snapshots(&self, limit: usize) -> Result<Vec<SnapshotMeta>, ZexportError> {
        self.with_store(move |store| store.list(limit)).await
    }

    /// Check if shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Abort running exports, stop the probe loop and close the session.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down service state");
        self.shutdown.cancel();
        self.supervisor.shutdown().await;
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, ZexportError>
    where
        F: FnOnce(&SnapshotStore) -> Result<T, ZexportError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| ZexportError::internal(format!("Store task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Record;
    use crate::services::publisher::NoopPublisher;
    use crate::services::testing::ScriptedConnector;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ServiceConfig {
        ServiceConfig::builder()
            .host("z.example.org")
            .database("books")
            .data_dir(dir.path().join("data"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_export_and_read_back() {
        let dir = TempDir::new().unwrap();
        let connector = ScriptedConnector::with_records(&["a", "b"]);
        let state = ZexportState::start(config(&dir), Arc::new(connector.clone()), Arc::new(NoopPublisher))
            .await
            .unwrap();

        assert_eq!(state.health(), HealthState::Alive);
        assert!(state.latest_snapshot().await.unwrap().is_none());

        let report = state.export().await.unwrap();
        let latest = state.latest_snapshot().await.unwrap().unwrap();
        assert_eq!(latest.id, report.snapshot_id);
        assert_eq!(latest.records, vec![Record::new("a"), Record::new("b")]);
        assert_eq!(state.snapshot(report.snapshot_id).await.unwrap(), Some(latest));
        assert_eq!(state.list_snapshots(5).await.unwrap().len(), 1);
        assert!(state.config().data_dir.join("current.txt").exists());

        state.shutdown().await;
        assert!(state.is_shutting_down());
        assert_eq!(connector.open_sessions(), 0);
        assert!(state.export().await.is_err());
    }

    #[tokio::test]
    async fn test_start_with_unreachable_server() {
        let dir = TempDir::new().unwrap();
        let state = ZexportState::start(
            config(&dir),
            Arc::new(ScriptedConnector::unreachable()),
            Arc::new(NoopPublisher),
        )
        .await
        .unwrap();

        assert_eq!(state.health(), HealthState::Dead);
        let err = state.export().await.unwrap_err();
        assert_eq!(err.status_code(), 503);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.export.current_file_name = String::new();

        let result = ZexportState::start(
            config,
            Arc::new(ScriptedConnector::with_records(&[])),
            Arc::new(NoopPublisher),
        )
        .await;
        assert!(matches!(result, Err(ZexportError::Config { .. })));
    }
}
