//! Supervision of the single record-server session.
//!
//! Provides:
//! - Initial connect before the service accepts traffic
//! - Non-blocking `acquire` of the current usable session
//! - A periodic probe loop that reconnects once per failed tick
//! - Background reconnect when an export reports a failed search
//!
//! Every change to {session, health} happens while holding `transition`, an
//! async mutex shared by the initial connect, probe ticks and reconnects. The
//! published view lives in a separate `RwLock` that is only held for
//! assignments, so `acquire` never waits on a reconnect in progress.

use crate::error::ZexportError;
use crate::models::{HealthState, SearchQuery, SessionPhase, SupervisorStatus, TargetConfig};
use crate::services::session::{ProbeOutcome, SessionConnector, SessionHandle};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

#[derive(Default)]
struct SupervisorView {
    session: Option<Arc<SessionHandle>>,
    health: HealthState,
    phase: SessionPhase,
    last_probe_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Owns the record-server session and keeps its liveness belief fresh.
pub struct ConnectionSupervisor {
    target: Arc<TargetConfig>,
    connector: Arc<dyn SessionConnector>,
    probe_query: SearchQuery,
    view: RwLock<SupervisorView>,
    transition: Mutex<()>,
    started: AtomicBool,
    reconnect_pending: AtomicBool,
    reconnect_attempts: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ConnectionSupervisor {
    /// Create a supervisor. No connection is made until [`start`](Self::start).
    pub fn new(
        target: TargetConfig,
        connector: Arc<dyn SessionConnector>,
        probe_query: SearchQuery,
    ) -> Self {
        Self {
            target: Arc::new(target),
            connector,
            probe_query: probe_query.probe(),
            view: RwLock::new(SupervisorView::default()),
            transition: Mutex::new(()),
            started: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            reconnect_attempts: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Get the target configuration.
    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Connect, then start the probe loop.
    ///
    /// A failed initial connect leaves the supervisor Dead rather than
    /// failing; the probe loop keeps retrying.
    pub async fn start(self: &Arc<Self>) -> HealthState {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.health();
        }

        tracing::info!(target = %self.target.display_url(), "Starting connection supervisor");

        let health = {
            let _transition = self.transition.lock().await;
            self.open_session_locked("initial connect").await
        };

        if health != HealthState::Alive {
            tracing::warn!(
                target = %self.target.display_url(),
                "Initial connect failed, starting without a session"
            );
        }

        let supervisor = Arc::clone(self);
        self.tasks.spawn(async move { supervisor.probe_loop().await });

        health
    }

    /// Get the current session if it is believed alive.
    ///
    /// Never connects; reconnection belongs to the probe loop.
    pub fn acquire(&self) -> Result<Arc<SessionHandle>, ZexportError> {
        if self.shutdown.is_cancelled() {
            return Err(ZexportError::unavailable("Service is shutting down"));
        }

        let view = self.view.read();
        match (&view.session, view.health) {
            (Some(session), HealthState::Alive) => Ok(Arc::clone(session)),
            _ => Err(ZexportError::unavailable(match view.phase {
                SessionPhase::Reconnecting => "Reconnect in progress",
                SessionPhase::NoSession if view.health == HealthState::Unknown => {
                    "Session has not been established yet"
                }
                _ => "Session is down",
            })),
        }
    }

    /// Current liveness belief.
    pub fn health(&self) -> HealthState {
        self.view.read().health
    }

    /// Point-in-time status for health reporting.
    pub fn status(&self) -> SupervisorStatus {
        let view = self.view.read();
        SupervisorStatus {
            phase: view.phase,
            health: view.health,
            session_id: view.session.as_ref().map(|s| s.id()),
            connected_at: view.session.as_ref().map(|s| s.opened_at()),
            last_probe_at: view.last_probe_at,
            last_error: view.last_error.clone(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            target: self.target.display_url(),
        }
    }

    /// Run one probe tick immediately.
    ///
    /// Without a session this opens one. With a session it probes; on
    /// failure it closes the session and makes exactly one reconnect attempt.
    pub async fn probe_now(&self) -> HealthState {
        let _transition = self.transition.lock().await;

        if self.shutdown.is_cancelled() {
            return self.health();
        }

        let current = self.view.read().session.clone();
        let health = match current {
            None => self.open_session_locked("probe tick").await,
            Some(session) => {
                match session.probe(&self.probe_query, self.target.options.probe_timeout()).await {
                    Ok(ProbeOutcome::Alive) => {
                        tracing::debug!(session_id = %session.id(), "Probe succeeded");
                        let mut view = self.view.write();
                        view.health = HealthState::Alive;
                        view.phase = SessionPhase::Alive;
                        HealthState::Alive
                    }
                    Ok(ProbeOutcome::Busy) => {
                        tracing::debug!(session_id = %session.id(), "Session busy, probe skipped");
                        self.health()
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session.id(), error = %e, "Probe failed");
                        self.mark_dead(e.to_string());
                        self.reconnect_locked(session).await
                    }
                }
            }
        };

        self.view.write().last_probe_at = Some(Utc::now());
        health
    }

    /// Mark the session dead after a failed search and reconnect in the background.
    ///
    /// Ignored if `session_id` is no longer the current session.
    pub fn report_failure(self: &Arc<Self>, session_id: Uuid, reason: &str) {
        {
            let mut view = self.view.write();
            if view.session.as_ref().map(|s| s.id()) != Some(session_id) {
                tracing::debug!(session_id = %session_id, "Failure reported for a replaced session");
                return;
            }
            view.health = HealthState::Dead;
            view.phase = SessionPhase::Dead;
            view.last_error = Some(reason.to_string());
        }

        tracing::warn!(session_id = %session_id, reason, "Session reported failed");

        if self.shutdown.is_cancelled() || self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let supervisor = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = supervisor.shutdown.cancelled() => {}
                _ = supervisor.reconnect_after_failure(session_id) => {}
            }
            supervisor.reconnect_pending.store(false, Ordering::SeqCst);
        });
    }

    /// Stop the probe loop and pending reconnects, then close the session.
    pub async fn shutdown(&self) {
        tracing::info!("Stopping connection supervisor");

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let _transition = self.transition.lock().await;
        let session = {
            let mut view = self.view.write();
            view.health = HealthState::Dead;
            view.phase = SessionPhase::NoSession;
            view.session.take()
        };

        if let Some(session) = session {
            let _ = session.close(self.target.options.close_timeout()).await;
        }
    }

    /// Token cancelled when the supervisor shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn probe_loop(self: Arc<Self>) {
        let period = self.target.options.probe_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(interval_secs = period.as_secs(), "Probe loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                health = self.probe_now() => {
                    tracing::debug!(health = health.as_str(), "Probe tick finished");
                }
            }
        }

        tracing::debug!("Probe loop stopped");
    }

    async fn reconnect_after_failure(&self, session_id: Uuid) {
        let _transition = self.transition.lock().await;
        self.reconnect_pending.store(false, Ordering::SeqCst);

        let current = self.view.read().session.clone();
        match current {
            Some(session) if session.id() == session_id => {
                self.reconnect_locked(session).await;
            }
            _ => {
                tracing::debug!(session_id = %session_id, "Session already replaced, reconnect skipped");
            }
        }
    }

    fn mark_dead(&self, reason: String) {
        let mut view = self.view.write();
        view.health = HealthState::Dead;
        view.phase = SessionPhase::Dead;
        view.last_error = Some(reason);
    }

    /// Close `stale` and make one attempt to open a replacement.
    ///
    /// Caller must hold `transition`.
    async fn reconnect_locked(&self, stale: Arc<SessionHandle>) -> HealthState {
        {
            let mut view = self.view.write();
            view.session = None;
            view.health = HealthState::Dead;
            view.phase = SessionPhase::Reconnecting;
        }

        if let Err(e) = stale.close(self.target.options.close_timeout()).await {
            tracing::debug!(session_id = %stale.id(), error = %e, "Ignoring close failure of stale session");
        }
        drop(stale);

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(attempt, target = %self.target.display_url(), "Reconnecting");

        self.open_session_locked("reconnect").await
    }

    /// Make one attempt to open a session and publish the outcome.
    ///
    /// Caller must hold `transition`.
    async fn open_session_locked(&self, reason: &str) -> HealthState {
        if self.shutdown.is_cancelled() {
            return self.health();
        }

        let opened = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return self.health();
            }
            opened = SessionHandle::open(self.connector.as_ref(), &self.target) => opened,
        };

        let mut view = self.view.write();
        match opened {
            Ok(session) => {
                tracing::info!(session_id = %session.id(), reason, "Session established");
                view.session = Some(Arc::new(session));
                view.health = HealthState::Alive;
                view.phase = SessionPhase::Alive;
                view.last_error = None;
                HealthState::Alive
            }
            Err(e) => {
                tracing::error!(reason, target = %self.target.display_url(), error = %e, "Connect failed");
                view.session = None;
                view.health = HealthState::Dead;
                view.phase = SessionPhase::Dead;
                view.last_error = Some(e.to_string());
                HealthState::Dead
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionOptions;
    use crate::services::testing::{ScriptedConnector, ScriptedSearch};
    use std::time::Duration;

    fn supervisor(connector: &ScriptedConnector) -> Arc<ConnectionSupervisor> {
        let target = TargetConfig::new("z.example.org", 210, "books");
        Arc::new(ConnectionSupervisor::new(
            target,
            Arc::new(connector.clone()),
            SearchQuery::all(),
        ))
    }

    #[tokio::test]
    async fn test_start_alive() {
        let connector = ScriptedConnector::with_records(&["a"]);
        let supervisor = supervisor(&connector);

        assert_eq!(supervisor.health(), HealthState::Unknown);
        assert!(supervisor.acquire().is_err());

        assert_eq!(supervisor.start().await, HealthState::Alive);
        let session = supervisor.acquire().unwrap();
        assert_eq!(supervisor.status().session_id, Some(session.id()));

        supervisor.shutdown().await;
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_start_unreachable_is_dead_not_fatal() {
        let connector = ScriptedConnector::unreachable();
        let supervisor = supervisor(&connector);

        assert_eq!(supervisor.start().await, HealthState::Dead);
        let err = supervisor.acquire().unwrap_err();
        assert!(matches!(err, ZexportError::ConnectionUnavailable { .. }));
        assert!(supervisor.status().last_error.is_some());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_tick_opens_missing_session() {
        let connector = ScriptedConnector::unreachable();
        let supervisor = supervisor(&connector);
        supervisor.start().await;

        connector.set_reachable(true);
        assert_eq!(supervisor.probe_now().await, HealthState::Alive);
        assert!(supervisor.acquire().is_ok());
        assert_eq!(connector.open_sessions(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_probe_reconnects_once() {
        let connector = ScriptedConnector::with_records(&["a"]);
        let supervisor = supervisor(&connector);
        supervisor.start().await;
        let first = supervisor.acquire().unwrap().id();

        connector.push_search(ScriptedSearch::Fail("connection reset".into()));
        connector.push_connects(&[false, true]);
        let attempts_before = connector.connect_attempts();

        assert_eq!(supervisor.probe_now().await, HealthState::Dead);
        assert_eq!(connector.connect_attempts(), attempts_before + 1);
        assert_eq!(connector.open_sessions(), 0);
        assert_eq!(supervisor.status().phase, SessionPhase::Dead);

        assert_eq!(supervisor.probe_now().await, HealthState::Alive);
        let second = supervisor.acquire().unwrap().id();
        assert_ne!(first, second);
        assert_eq!(connector.open_sessions(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_failure_reconnects_in_background() {
        let connector = ScriptedConnector::with_records(&["a"]);
        let supervisor = supervisor(&connector);
        supervisor.start().await;
        let first = supervisor.acquire().unwrap().id();

        supervisor.report_failure(first, "search failed");
        assert_ne!(supervisor.health(), HealthState::Alive);

        let mut replaced = false;
        for _ in 0..50 {
            if let Ok(session) = supervisor.acquire() {
                replaced = session.id() != first;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(replaced);
        assert_eq!(connector.open_sessions(), 1);
        assert_eq!(supervisor.status().reconnect_attempts, 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_report_failure_for_replaced_session_is_ignored() {
        let connector = ScriptedConnector::with_records(&["a"]);
        let supervisor = supervisor(&connector);
        supervisor.start().await;

        supervisor.report_failure(Uuid::new_v4(), "stale");
        assert_eq!(supervisor.health(), HealthState::Alive);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_loop_recovers_on_interval() {
        let connector = ScriptedConnector::unreachable();
        let target = TargetConfig::new("z.example.org", 210, "books").with_options(SessionOptions {
            probe_interval_secs: 1,
            ..SessionOptions::default()
        });
        let supervisor = Arc::new(ConnectionSupervisor::new(
            target,
            Arc::new(connector.clone()),
            SearchQuery::all(),
        ));

        assert_eq!(supervisor.start().await, HealthState::Dead);
        connector.set_reachable(true);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(supervisor.health(), HealthState::Alive);
        assert!(supervisor.status().last_probe_at.is_some());

        supervisor.shutdown().await;
        assert_eq!(connector.open_sessions(), 0);
        assert!(supervisor.acquire().is_err());
    }
}
