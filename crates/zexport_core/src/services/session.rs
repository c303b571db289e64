//! Record-server session abstraction.
//!
//! The wire protocol is behind two traits: a [`SessionConnector`] opens
//! sessions and a [`RecordSession`] runs searches on one. [`SessionHandle`]
//! wraps an open session with its identity, liveness flag and time budgets,
//! and serializes access so only one search is outstanding at a time.

use crate::error::ZexportError;
use crate::models::{Record, SearchQuery, TargetConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One open session to the record server.
#[async_trait]
pub trait RecordSession: Send {
    /// Run a search and return the retrieved records in server order.
    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<Record>, ZexportError>;

    /// Close the session. Called at most once.
    async fn close(&mut self) -> Result<(), ZexportError>;
}

/// Opens sessions to the record server.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Establish a new session. May take minutes.
    async fn connect(&self, target: &TargetConfig) -> Result<Box<dyn RecordSession>, ZexportError>;
}

/// Result of a liveness probe that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe query succeeded
    Alive,
    /// A search is running on the session; it was not probed
    Busy,
}

/// A supervised session with identity and liveness tracking.
pub struct SessionHandle {
    id: Uuid,
    host: String,
    port: u16,
    database: String,
    opened_at: DateTime<Utc>,
    alive: AtomicBool,
    session: Mutex<Option<Box<dyn RecordSession>>>,
}

impl SessionHandle {
    /// Open a session within the target's connect timeout.
    pub async fn open(
        connector: &dyn SessionConnector,
        target: &TargetConfig,
    ) -> Result<Self, ZexportError> {
        let budget = target.options.connect_timeout();

        tracing::debug!(target = %target.display_url(), "Opening session");

        let session = match tokio::time::timeout(budget, connector.connect(target)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e @ ZexportError::Connection { .. })) => return Err(e),
            Ok(Err(other)) => {
                return Err(ZexportError::connection_with_source(
                    format!("Failed to open session to {}", target.display_url()),
                    other,
                ))
            }
            Err(_) => {
                return Err(ZexportError::connection(format!(
                    "Connecting to {} timed out after {}s",
                    target.display_url(),
                    budget.as_secs()
                )))
            }
        };

        let handle = Self {
            id: Uuid::new_v4(),
            host: target.host.clone(),
            port: target.port,
            database: target.database.clone(),
            opened_at: Utc::now(),
            alive: AtomicBool::new(true),
            session: Mutex::new(Some(session)),
        };

        tracing::info!(
            session_id = %handle.id,
            host = %handle.host,
            port = handle.port,
            database = %handle.database,
            "Session opened"
        );

        Ok(handle)
    }

    /// Get the session's unique identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Get when this session was opened.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Check the session's own liveness flag.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Run a search within `budget`.
    ///
    /// Waits for any other search on this session to finish first.
    pub async fn search(
        &self,
        query: &SearchQuery,
        budget: Duration,
    ) -> Result<Vec<Record>, ZexportError> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| ZexportError::query_failed("Session is closed", Some(self.id)))?;

        tracing::debug!(session_id = %self.id, query = %query.text, limit = ?query.limit, "Searching");

        match tokio::time::timeout(budget, session.search(query)).await {
            Ok(Ok(records)) => {
                tracing::debug!(session_id = %self.id, count = records.len(), "Search completed");
                Ok(records)
            }
            Ok(Err(e)) => {
                self.alive.store(false, Ordering::Release);
                tracing::warn!(session_id = %self.id, error = %e, "Search failed");
                Err(ZexportError::query_failed(e.to_string(), Some(self.id)))
            }
            Err(_) => {
                self.alive.store(false, Ordering::Release);
                tracing::warn!(session_id = %self.id, budget_secs = budget.as_secs(), "Search timed out");
                Err(ZexportError::query_failed(
                    format!("Search timed out after {}s", budget.as_secs()),
                    Some(self.id),
                ))
            }
        }
    }

    /// Issue a one-record liveness query within `budget`.
    ///
    /// Returns [`ProbeOutcome::Busy`] without touching the session if a
    /// search is already running on it.
    pub async fn probe(
        &self,
        query: &SearchQuery,
        budget: Duration,
    ) -> Result<ProbeOutcome, ZexportError> {
        let Ok(mut guard) = self.session.try_lock() else {
            return Ok(ProbeOutcome::Busy);
        };
        let session = guard
            .as_mut()
            .ok_or_else(|| ZexportError::probe("Session is closed", Some(self.id)))?;

        let probe = query.probe();
        let result = match tokio::time::timeout(budget, session.search(&probe)).await {
            Ok(Ok(_)) => Ok(ProbeOutcome::Alive),
            Ok(Err(e)) => Err(ZexportError::probe(e.to_string(), Some(self.id))),
            Err(_) => Err(ZexportError::probe(
                format!("Probe timed out after {}s", budget.as_secs()),
                Some(self.id),
            )),
        };

        self.alive.store(result.is_ok(), Ordering::Release);
        result
    }

    /// Close the session within `budget`. Idempotent.
    pub async fn close(&self, budget: Duration) -> Result<(), ZexportError> {
        self.alive.store(false, Ordering::Release);

        let close = async {
            let mut guard = self.session.lock().await;
            match guard.take() {
                Some(mut session) => session.close().await,
                None => Ok(()),
            }
        };

        let result = match tokio::time::timeout(budget, close).await {
            Ok(result) => result,
            Err(_) => Err(ZexportError::timeout("Session close", budget)),
        };

        match &result {
            Ok(()) => tracing::info!(session_id = %self.id, "Session closed"),
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "Session close failed"),
        }
        result
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("alive", &self.is_alive())
            .finish()
    }
}
