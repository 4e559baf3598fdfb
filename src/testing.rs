// Test doubles shared by the unit tests

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

use crate::balance::BalanceStore;
use crate::clock::{Clock, ManualClock};
use crate::enforcer::{AccessEnforcer, UsageMeter};
use crate::events::EventBus;
use crate::ids::{SessionId, SubscriberId};
use crate::quota::Allowance;
use crate::session::{RetryPolicy, SessionConfig, SessionManager, SessionSnapshot, SessionState};
use crate::storage::RecordStore;

/// Enforcer and meter whose behaviour each test scripts
#[derive(Debug, Default)]
pub(crate) struct ScriptedEnforcer {
    grant_failures: AtomicU32,
    revoke_failures: AtomicU32,
    grant_delay_ms: AtomicU64,
    revoke_delay_ms: AtomicU64,
    bytes: AtomicU64,
    grants: AtomicU32,
    revokes: AtomicU32,
}

impl ScriptedEnforcer {
    /// Fail the next `count` grant attempts
    pub(crate) fn fail_grants(&self, count: u32) {
        self.grant_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` revoke attempts
    pub(crate) fn fail_revokes(&self, count: u32) {
        self.revoke_failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_grant_delay(&self, delay: Duration) {
        self.grant_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_revoke_delay(&self, delay: Duration) {
        self.revoke_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Cumulative byte counter reported for every session
    pub(crate) fn set_bytes(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }

    /// Grant attempts so far
    pub(crate) fn grants(&self) -> u32 {
        self.grants.load(Ordering::SeqCst)
    }

    /// Revoke attempts so far
    pub(crate) fn revokes(&self) -> u32 {
        self.revokes.load(Ordering::SeqCst)
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn delay(millis: &AtomicU64) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl AccessEnforcer for ScriptedEnforcer {
    async fn grant(&self, _: &SubscriberId, _: &SessionId) -> Result<()> {
        self.grants.fetch_add(1, Ordering::SeqCst);
        delay(&self.grant_delay_ms).await;
        if take_failure(&self.grant_failures) {
            anyhow::bail!("scripted grant failure");
        }
        Ok(())
    }

    async fn revoke(&self, _: &SubscriberId, _: &SessionId) -> Result<()> {
        self.revokes.fetch_add(1, Ordering::SeqCst);
        delay(&self.revoke_delay_ms).await;
        if take_failure(&self.revoke_failures) {
            anyhow::bail!("scripted revoke failure");
        }
        Ok(())
    }
}

#[async_trait]
impl UsageMeter for ScriptedEnforcer {
    async fn bytes_transferred(&self, _: &SubscriberId, _: &SessionId) -> Result<u64> {
        Ok(self.bytes.load(Ordering::SeqCst))
    }
}

/// Session timing used by tests: one-minute ticks, fast retries
pub(crate) fn test_session_config() -> SessionConfig {
    SessionConfig {
        accrual_interval: Duration::from_secs(60),
        starting_timeout: Duration::from_secs(30),
        stopping_timeout: Duration::from_secs(30),
        retry: RetryPolicy {
            retry_interval: Duration::from_secs(1),
            max_retries: 2,
        },
    }
}

/// A session manager wired to scripted collaborators
pub(crate) struct Harness {
    pub(crate) sessions: SessionManager,
    pub(crate) balances: Arc<BalanceStore>,
    pub(crate) enforcer: Arc<ScriptedEnforcer>,
    pub(crate) clock: ManualClock,
}

impl Harness {
    pub(crate) fn in_memory() -> Self {
        Self::build(
            RecordStore::in_memory("balances"),
            RecordStore::in_memory("sessions"),
            Arc::new(ScriptedEnforcer::default()),
            ManualClock::default(),
        )
    }

    pub(crate) fn persistent(root: &Path) -> Self {
        Self::build(
            RecordStore::open(root, "balances").unwrap(),
            RecordStore::open(root, "sessions").unwrap(),
            Arc::new(ScriptedEnforcer::default()),
            ManualClock::default(),
        )
    }

    /// Fresh engine state from `root`, sharing the clock and controller of `other`
    pub(crate) fn reopen(root: &Path, other: &Harness) -> Self {
        Self::build(
            RecordStore::open(root, "balances").unwrap(),
            RecordStore::open(root, "sessions").unwrap(),
            other.enforcer.clone(),
            other.clock.clone(),
        )
    }

    fn build(
        balance_store: RecordStore<crate::balance::Balance>,
        session_store: RecordStore<crate::session::Session>,
        enforcer: Arc<ScriptedEnforcer>,
        clock: ManualClock,
    ) -> Self {
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let events = EventBus::new();
        let balances =
            Arc::new(BalanceStore::load(balance_store, shared_clock.clone(), events.clone()).unwrap());
        let sessions = SessionManager::new(
            balances.clone(),
            enforcer.clone(),
            enforcer.clone(),
            shared_clock,
            session_store,
            events,
            test_session_config(),
        );

        Self {
            sessions,
            balances,
            enforcer,
            clock,
        }
    }

    pub(crate) async fn credit(&self, subscriber: &SubscriberId, data: Allowance, time: Allowance) {
        self.balances.credit(subscriber, data, time).await.unwrap();
    }
}

/// Wait until the watched session reaches `state`
pub(crate) async fn wait_for_state(
    rx: &mut watch::Receiver<SessionSnapshot>,
    state: SessionState,
) -> SessionSnapshot {
    rx.wait_for(|s| s.state == state)
        .await
        .expect("session channel closed")
        .clone()
}
