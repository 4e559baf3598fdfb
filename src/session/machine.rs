use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::handshake::{RetryPolicy, handshake};
use super::record::{EndReason, Session, SessionSnapshot, SessionState};
use crate::balance::BalanceStore;
use crate::clock::Clock;
use crate::enforcer::{AccessEnforcer, UsageMeter};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::ids::{SessionId, SubscriberId};
use crate::storage::RecordStore;

/// Timing of the session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Time between accrual ticks of an active session
    pub accrual_interval: Duration,
    /// Maximum time a session may wait for its grant
    pub starting_timeout: Duration,
    /// Maximum time a session may wait for its revocation
    pub stopping_timeout: Duration,
    /// Backoff for failed enforcer calls
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            accrual_interval: Duration::from_secs(60),
            starting_timeout: Duration::from_secs(60),
            stopping_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// What `recover` found in the session store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub starting: usize,
    pub stopping: usize,
    pub archived: usize,
    /// Older live records closed because a newer session replaced them
    pub superseded: usize,
}

/// How a driver phase finished
pub(super) enum Flow {
    /// Move on to the session's next state
    Continue,
    /// The manager is shutting down; leave the session as it is
    Shutdown,
}

/// A session that has a driver task
pub(super) struct LiveSession {
    pub(super) record: Mutex<Session>,
    /// Signalled when a stop is requested
    pub(super) wake: Notify,
    watch: watch::Sender<SessionSnapshot>,
}

impl LiveSession {
    fn new(session: Session) -> Self {
        let (watch, _) = watch::channel(session.snapshot());
        Self {
            record: Mutex::new(session),
            wake: Notify::new(),
            watch,
        }
    }
}

/// Latest session of one subscriber
#[derive(Default)]
struct Slot {
    current: Option<Arc<LiveSession>>,
}

pub(super) struct Shared {
    pub(super) balances: Arc<BalanceStore>,
    pub(super) enforcer: Arc<dyn AccessEnforcer>,
    pub(super) meter: Arc<dyn UsageMeter>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: SessionConfig,
    store: RecordStore<Session>,
    events: EventBus,
    slots: RwLock<HashMap<SubscriberId, Arc<Mutex<Slot>>>>,
    history: RwLock<Vec<SessionSnapshot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Owns every session and drives each one through its lifecycle.
///
/// Each live session has its own driver task. Decisions for a subscriber are
/// taken under that subscriber's slot lock and the session's record lock;
/// the registry lock is only held to look a slot up.
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(
        balances: Arc<BalanceStore>,
        enforcer: Arc<dyn AccessEnforcer>,
        meter: Arc<dyn UsageMeter>,
        clock: Arc<dyn Clock>,
        store: RecordStore<Session>,
        events: EventBus,
        config: SessionConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                balances,
                enforcer,
                meter,
                clock,
                config,
                store,
                events,
                slots: RwLock::new(HashMap::new()),
                history: RwLock::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                shutdown,
            }),
        }
    }

    /// Reload persisted sessions and restart their drivers.
    ///
    /// Active sessions resume accrual from their last accrual, Starting
    /// sessions retry the grant and Stopping sessions retry the revocation.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.restore(true).await
    }

    /// Reload persisted sessions for inspection without driving them
    pub async fn load(&self) -> Result<RecoveryReport> {
        self.restore(false).await
    }

    async fn restore(&self, resume: bool) -> Result<RecoveryReport> {
        let mut records = self.shared.store.load_all()?;
        records.sort_by_key(|s| s.started_at);

        let mut report = RecoveryReport::default();
        let mut archived = Vec::new();
        let mut live: HashMap<SubscriberId, Session> = HashMap::new();
        let mut duplicates = Vec::new();

        for session in records {
            match session.state {
                SessionState::Ended => {
                    archived.push(session.snapshot());
                    report.archived += 1;
                }
                SessionState::Idle => {
                    warn!("Ignoring session record {} in idle state", session.id);
                }
                _ => {
                    let newer = session.id.clone();
                    if let Some(older) = live.insert(session.subscriber.clone(), session) {
                        duplicates.push((older, newer));
                    }
                }
            }
        }

        self.shared.history.write().await.extend(archived);

        for (older, newer) in duplicates {
            if resume {
                self.close_superseded(older, &newer).await?;
                report.superseded += 1;
            } else {
                warn!(
                    "Session {} of {} is superseded by {} and will be closed when the engine starts",
                    older.id, older.subscriber, newer
                );
            }
        }

        for (subscriber, session) in live {
            match session.state {
                SessionState::Active => report.resumed += 1,
                SessionState::Starting => report.starting += 1,
                _ => report.stopping += 1,
            }

            if resume {
                info!(
                    "Recovering {} session {} for {}",
                    session.state, session.id, subscriber
                );
            }

            let slot = self.shared.slot(&subscriber).await;
            let live = Arc::new(LiveSession::new(session));
            slot.lock().await.current = Some(live.clone());

            if resume {
                self.spawn(live).await;
            }
        }

        if resume {
            info!(
                "Session recovery complete: {} resumed, {} starting, {} stopping, {} archived, {} superseded",
                report.resumed, report.starting, report.stopping, report.archived, report.superseded
            );
        }
        Ok(report)
    }

    /// End a live record left behind by a newer session of the same
    /// subscriber, revoking whatever access it may still hold.
    async fn close_superseded(&self, mut session: Session, newer: &SessionId) -> Result<()> {
        error!(
            "Subscriber {} has more than one live session; closing {} in favour of {}",
            session.subscriber, session.id, newer
        );

        let (subscriber, session_id) = (session.subscriber.clone(), session.id.clone());
        let enforcer = &self.shared.enforcer;
        let revoked = handshake(
            &self.shared.config.retry,
            self.shared.config.stopping_timeout,
            "revoke",
            || enforcer.revoke(&subscriber, &session_id),
        )
        .await;

        let mut failure = format!("Superseded by session {}", newer);
        if let Err(detail) = revoked {
            warn!("Failed to revoke superseded session {}: {}", session_id, detail);
            failure = format!("{}; {}", failure, detail);
        }

        session.superseded_reason = session.end_reason.or(session.pending_stop);
        session.state = SessionState::Ended;
        session.end_reason = Some(EndReason::EnforcementFailure);
        session.pending_stop = None;
        session.failure = Some(failure);
        session.ended_at = Some(self.shared.clock.now());

        self.shared.store.put(&session_id.to_string(), &session)?;
        self.shared.archive(&session).await;
        Ok(())
    }

    /// Start a session for a subscriber with a usable balance.
    ///
    /// Returns as soon as the session is recorded as Starting; the grant
    /// completes in the background and is published on the session's watch
    /// channel.
    pub async fn start(&self, subscriber: &SubscriberId) -> EngineResult<SessionSnapshot> {
        let (snapshot, _) = self.begin(subscriber).await?;
        Ok(snapshot)
    }

    /// Start a session and wait until the grant handshake settles.
    ///
    /// A grant that fails is returned as `EnforcementFailure`. Otherwise the
    /// result is the Active session, or a later state if a stop was queued
    /// while it was starting.
    pub async fn start_and_wait(&self, subscriber: &SubscriberId) -> EngineResult<SessionSnapshot> {
        let (_, mut rx) = self.begin(subscriber).await?;

        let settled = rx
            .wait_for(|s| s.state != SessionState::Starting)
            .await
            .map(|s| s.clone());
        let settled = match settled {
            Ok(snapshot) => snapshot,
            Err(_) => rx.borrow().clone(),
        };

        if settled.activated_at.is_none()
            && settled.end_reason == Some(EndReason::EnforcementFailure)
        {
            return Err(EngineError::EnforcementFailure {
                session_id: settled.id,
                detail: settled.failure.unwrap_or_default(),
            });
        }
        Ok(settled)
    }

    async fn begin(
        &self,
        subscriber: &SubscriberId,
    ) -> EngineResult<(SessionSnapshot, watch::Receiver<SessionSnapshot>)> {
        let slot = self.shared.slot(subscriber).await;
        let mut slot = slot.lock().await;

        if let Some(current) = &slot.current {
            let session = current.record.lock().await;
            if session.state.is_live() {
                return Err(EngineError::SessionAlreadyActive {
                    subscriber: subscriber.clone(),
                    session_id: session.id.clone(),
                });
            }
        }

        let balance = self.shared.balances.read(subscriber).await;
        if !balance.can_start_session() {
            return Err(EngineError::InsufficientBalance {
                subscriber: subscriber.clone(),
            });
        }

        let session = Session::starting(subscriber.clone(), self.shared.clock.now());
        self.shared.store.put(&session.id.to_string(), &session)?;

        let snapshot = session.snapshot();
        let live = Arc::new(LiveSession::new(session));
        let rx = live.watch.subscribe();
        slot.current = Some(live.clone());
        drop(slot);

        info!("Session {} starting for {}", snapshot.id, subscriber);
        self.shared
            .events
            .publish(EngineEvent::SessionChanged(snapshot.clone()));
        self.spawn(live).await;

        Ok((snapshot, rx))
    }

    /// Stop the subscriber's session at their request
    pub async fn stop(&self, subscriber: &SubscriberId) -> EngineResult<SessionSnapshot> {
        self.request_end(subscriber, EndReason::UserStopped).await
    }

    /// Terminate the subscriber's session administratively
    pub async fn admin_revoke(&self, subscriber: &SubscriberId) -> EngineResult<SessionSnapshot> {
        self.request_end(subscriber, EndReason::AdminRevoked).await
    }

    async fn request_end(
        &self,
        subscriber: &SubscriberId,
        reason: EndReason,
    ) -> EngineResult<SessionSnapshot> {
        let live = self
            .shared
            .current(subscriber)
            .await
            .ok_or_else(|| EngineError::SessionNotFound {
                subscriber: subscriber.clone(),
            })?;

        let mut session = live.record.lock().await;
        match session.state {
            SessionState::Starting => {
                // First stop wins; it is applied once the grant completes
                if session.pending_stop.is_none() {
                    let mut updated = session.clone();
                    updated.pending_stop = Some(reason);
                    self.shared.commit(&live, &mut session, updated)?;
                    info!("Session {} is starting; {} queued", session.id, reason);
                }
            }
            SessionState::Active => {
                let now = self.shared.clock.now();
                self.shared
                    .begin_stopping(&live, &mut session, reason, now)
                    .await?;
            }
            SessionState::Stopping | SessionState::Ended | SessionState::Idle => {
                debug!(
                    "Ignoring {} for session {} in {} state",
                    reason, session.id, session.state
                );
            }
        }

        Ok(session.snapshot())
    }

    /// Latest session of a subscriber, including an ended one
    pub async fn session(&self, subscriber: &SubscriberId) -> Option<SessionSnapshot> {
        let live = self.shared.current(subscriber).await?;
        let session = live.record.lock().await;
        Some(session.snapshot())
    }

    /// State of the subscriber's access; Idle when no session is live
    pub async fn state(&self, subscriber: &SubscriberId) -> SessionState {
        match self.session(subscriber).await {
            Some(snapshot) if snapshot.state.is_live() => snapshot.state,
            _ => SessionState::Idle,
        }
    }

    /// Follow the subscriber's latest session.
    ///
    /// The receiver stays bound to that session; a later start creates a new
    /// session with its own channel.
    pub async fn watch(&self, subscriber: &SubscriberId) -> Option<watch::Receiver<SessionSnapshot>> {
        let live = self.shared.current(subscriber).await?;
        Some(live.watch.subscribe())
    }

    /// Sessions that are Starting, Active or Stopping
    pub async fn active_sessions(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<_> = self.shared.slots.read().await.values().cloned().collect();

        let mut sessions = Vec::new();
        for slot in slots {
            let current = slot.lock().await.current.clone();
            if let Some(live) = current {
                let session = live.record.lock().await;
                if session.state.is_live() {
                    sessions.push(session.snapshot());
                }
            }
        }

        sessions.sort_by(|a, b| a.subscriber.cmp(&b.subscriber));
        sessions
    }

    /// Ended sessions, newest first, optionally for one subscriber
    pub async fn history(&self, subscriber: Option<&SubscriberId>) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self
            .shared
            .history
            .read()
            .await
            .iter()
            .filter(|s| subscriber.is_none_or(|sub| &s.subscriber == sub))
            .cloned()
            .collect();

        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions
    }

    /// Stop every driver task without ending any session.
    ///
    /// Sessions stay in their current state on disk and are picked up again
    /// by `recover`.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.shared.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }

        info!("Session manager stopped");
    }

    async fn spawn(&self, live: Arc<LiveSession>) {
        let handle = tokio::spawn(drive(self.shared.clone(), live));

        let mut tasks = self.shared.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

/// Drive one session until it ends or the manager shuts down
async fn drive(shared: Arc<Shared>, live: Arc<LiveSession>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let state = live.record.lock().await.state;
        let flow = match state {
            SessionState::Starting => shared.run_starting(&live, &mut shutdown).await,
            SessionState::Active => shared.run_active(&live, &mut shutdown).await,
            SessionState::Stopping => shared.run_stopping(&live, &mut shutdown).await,
            SessionState::Idle | SessionState::Ended => return,
        };

        if let Flow::Shutdown = flow {
            debug!("Session driver exiting for shutdown");
            return;
        }
    }
}

impl Shared {
    async fn slot(&self, subscriber: &SubscriberId) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().await.get(subscriber) {
            return slot.clone();
        }

        self.slots
            .write()
            .await
            .entry(subscriber.clone())
            .or_default()
            .clone()
    }

    async fn current(&self, subscriber: &SubscriberId) -> Option<Arc<LiveSession>> {
        let slot = self.slots.read().await.get(subscriber).cloned()?;
        let slot = slot.lock().await;
        slot.current.clone()
    }

    /// Persist `updated`, then make it the current record
    pub(super) fn commit(
        &self,
        live: &LiveSession,
        current: &mut Session,
        updated: Session,
    ) -> EngineResult<()> {
        self.store.put(&updated.id.to_string(), &updated)?;
        *current = updated;
        self.publish(live, current);
        Ok(())
    }

    /// Make `updated` current even if it cannot be persisted.
    ///
    /// Used once usage has already been debited, so the in-memory record
    /// never lags behind the balance.
    pub(super) fn commit_charged(&self, live: &LiveSession, current: &mut Session, updated: Session) {
        *current = updated;
        self.publish(live, current);

        if let Err(e) = self.store.put(&current.id.to_string(), current) {
            error!(
                "Failed to persist session {} after accrual; will retry next tick: {}",
                current.id, e
            );
        }
    }

    fn publish(&self, live: &LiveSession, session: &Session) {
        let snapshot = session.snapshot();
        live.watch.send_replace(snapshot.clone());
        self.events.publish(EngineEvent::SessionChanged(snapshot));
    }

    /// Charge usage up to `now` and move an Active session to Stopping.
    ///
    /// If the final charge exhausts the balance, the exhaustion reason
    /// stands instead of `reason`.
    pub(super) async fn begin_stopping(
        &self,
        live: &LiveSession,
        session: &mut Session,
        reason: EndReason,
        now: chrono::DateTime<chrono::Utc>,
    ) -> EngineResult<()> {
        if self.accrue(live, session, now).await?.is_some() {
            return Ok(());
        }

        let mut updated = session.clone();
        updated.state = SessionState::Stopping;
        updated.end_reason = Some(reason);
        updated.pending_stop = None;
        self.commit(live, session, updated)?;

        live.wake.notify_one();
        info!("Session {} stopping: {}", session.id, reason);
        Ok(())
    }

    async fn run_starting(&self, live: &LiveSession, shutdown: &mut watch::Receiver<bool>) -> Flow {
        let (subscriber, session_id) = {
            let session = live.record.lock().await;
            (session.subscriber.clone(), session.id.clone())
        };

        let enforcer = &self.enforcer;
        let (subscriber, session_id) = (&subscriber, &session_id);
        let result = tokio::select! {
            result = handshake(
                &self.config.retry,
                self.config.starting_timeout,
                "grant",
                move || enforcer.grant(subscriber, session_id),
            ) => result,
            _ = shutdown.changed() => return Flow::Shutdown,
        };

        let mut session = live.record.lock().await;
        if session.state != SessionState::Starting {
            return Flow::Continue;
        }

        let now = self.clock.now();
        let mut updated = session.clone();
        match result {
            Ok(()) => {
                updated.state = SessionState::Active;
                updated.activated_at = Some(now);
                updated.last_accrual = now;
                updated.metered_bytes = 0;
            }
            Err(detail) => {
                error!("Failed to grant access for session {}: {}", session_id, detail);

                // The controller may have applied part of the grant
                if let Err(e) = self.enforcer.revoke(subscriber, session_id).await {
                    warn!("Cleanup revoke for session {} failed: {:#}", session_id, e);
                }

                updated.state = SessionState::Ended;
                updated.end_reason = Some(EndReason::EnforcementFailure);
                updated.superseded_reason = updated.pending_stop.take();
                updated.failure = Some(detail);
                updated.ended_at = Some(now);
            }
        }

        let ended = updated.state == SessionState::Ended;
        if let Err(e) = self.commit(live, &mut session, updated) {
            error!("Failed to record grant outcome for session {}: {}", session_id, e);
            drop(session);
            return self.pause_before_retry(shutdown).await;
        }

        if ended {
            self.archive(&session).await;
        } else {
            info!("Session {} active for {}", session_id, subscriber);
        }
        Flow::Continue
    }

    async fn run_stopping(&self, live: &LiveSession, shutdown: &mut watch::Receiver<bool>) -> Flow {
        let (subscriber, session_id) = {
            let session = live.record.lock().await;
            (session.subscriber.clone(), session.id.clone())
        };

        let enforcer = &self.enforcer;
        let (subscriber, session_id) = (&subscriber, &session_id);
        let result = tokio::select! {
            result = handshake(
                &self.config.retry,
                self.config.stopping_timeout,
                "revoke",
                move || enforcer.revoke(subscriber, session_id),
            ) => result,
            _ = shutdown.changed() => return Flow::Shutdown,
        };

        let mut session = live.record.lock().await;
        if session.state != SessionState::Stopping {
            return Flow::Continue;
        }

        let mut updated = session.clone();
        updated.state = SessionState::Ended;
        updated.ended_at = Some(self.clock.now());
        if let Err(detail) = result {
            error!("Failed to revoke access for session {}: {}", session_id, detail);
            updated.superseded_reason = updated.end_reason;
            updated.end_reason = Some(EndReason::EnforcementFailure);
            updated.failure = Some(detail);
        }

        if let Err(e) = self.commit(live, &mut session, updated) {
            error!("Failed to record end of session {}: {}", session_id, e);
            drop(session);
            return self.pause_before_retry(shutdown).await;
        }

        self.archive(&session).await;
        Flow::Continue
    }

    async fn archive(&self, session: &Session) {
        info!(
            "Session {} for {} ended ({}): {} bytes, {}s",
            session.id,
            session.subscriber,
            session
                .end_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            session.usage.data_bytes,
            session.usage.time_seconds
        );
        self.history.write().await.push(session.snapshot());
    }

    async fn pause_before_retry(&self, shutdown: &mut watch::Receiver<bool>) -> Flow {
        tokio::select! {
            _ = sleep(self.config.retry.retry_interval) => Flow::Continue,
            _ = shutdown.changed() => Flow::Shutdown,
        }
    }
}
