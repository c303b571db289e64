//! Scripted connector and publisher used by unit tests.

use crate::error::ZexportError;
use crate::models::{Record, SearchQuery, TargetConfig};
use crate::services::publisher::{SnapshotPublisher, SnapshotUpload};
use crate::services::session::{RecordSession, SessionConnector};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Override for the next search on any session.
#[derive(Debug, Clone)]
pub(crate) enum ScriptedSearch {
    /// Return these records
    Records(Vec<String>),
    /// Fail with this message
    Fail(String),
    /// Never complete
    Hang,
}

#[derive(Default)]
struct Shared {
    records: Mutex<Vec<Record>>,
    reachable: AtomicBool,
    connect_script: Mutex<VecDeque<bool>>,
    searches: Mutex<VecDeque<ScriptedSearch>>,
    search_delay: Mutex<Option<Duration>>,
    last_query: Mutex<Option<SearchQuery>>,
    connects: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Connector whose behaviour is scripted by the test.
#[derive(Clone)]
pub(crate) struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    pub(crate) fn with_records(records: &[&str]) -> Self {
        let connector = Self { shared: Arc::new(Shared::default()) };
        connector.set_records(records);
        connector.set_reachable(true);
        connector
    }

    pub(crate) fn unreachable() -> Self {
        let connector = Self::with_records(&[]);
        connector.set_reachable(false);
        connector
    }

    pub(crate) fn set_records(&self, records: &[&str]) {
        *self.shared.records.lock() = records.iter().map(|r| Record::new(*r)).collect();
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queue outcomes for the next connect attempts, ahead of `reachable`.
    pub(crate) fn push_connects(&self, outcomes: &[bool]) {
        self.shared.connect_script.lock().extend(outcomes.iter().copied());
    }

    pub(crate) fn push_search(&self, search: ScriptedSearch) {
        self.shared.searches.lock().push_back(search);
    }

    pub(crate) fn set_search_delay(&self, delay: Duration) {
        *self.shared.search_delay.lock() = Some(delay);
    }

    pub(crate) fn last_query(&self) -> Option<SearchQuery> {
        self.shared.last_query.lock().clone()
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed.
    pub(crate) fn open_sessions(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst) - self.shared.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self, target: &TargetConfig) -> Result<Box<dyn RecordSession>, ZexportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let scripted = self.shared.connect_script.lock().pop_front();
        let ok = scripted.unwrap_or_else(|| self.shared.reachable.load(Ordering::SeqCst));
        if !ok {
            return Err(ZexportError::connection(format!(
                "{} refused the connection",
                target.display_url()
            )));
        }
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession { shared: self.shared.clone(), closed: false }))
    }
}

struct ScriptedSession {
    shared: Arc<Shared>,
    closed: bool,
}

#[async_trait]
impl RecordSession for ScriptedSession {
    async fn search(&mut self, query: &SearchQuery) -> Result<Vec<Record>, ZexportError> {
        *self.shared.last_query.lock() = Some(query.clone());

        let delay = *self.shared.search_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.shared.searches.lock().pop_front();
        if matches!(scripted, Some(ScriptedSearch::Hang)) {
            std::future::pending::<()>().await;
        }

        let records: Vec<Record> = match scripted {
            Some(ScriptedSearch::Records(records)) => {
                records.into_iter().map(Record::from).collect()
            }
            Some(ScriptedSearch::Fail(message)) => {
                return Err(ZexportError::internal(message));
            }
            Some(ScriptedSearch::Hang) | None => self.shared.records.lock().clone(),
        };

        Ok(match query.limit {
            Some(limit) => records.into_iter().take(limit).collect(),
            None => records,
        })
    }

    async fn close(&mut self) -> Result<(), ZexportError> {
        if !self.closed {
            self.closed = true;
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Publisher that records uploads and can be told to fail.
#[derive(Clone, Default)]
pub(crate) struct RecordingPublisher {
    uploads: Arc<Mutex<Vec<SnapshotUpload>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingPublisher {
    pub(crate) fn failing(message: &str) -> Self {
        let publisher = Self::default();
        *publisher.failure.lock() = Some(message.to_string());
        publisher
    }

    pub(crate) fn uploads(&self) -> Vec<SnapshotUpload> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl SnapshotPublisher for RecordingPublisher {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn publish(&self, upload: &SnapshotUpload) -> Result<(), ZexportError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(ZexportError::downstream(message, None));
        }
        self.uploads.lock().push(upload.clone());
        Ok(())
    }
}
