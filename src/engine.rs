use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::balance::{Balance, BalanceStore};
use crate::catalog::{Plan, PlanCatalog};
use crate::clock::{Clock, SystemClock};
use crate::enforcer::{AccessEnforcer, LogOnlyEnforcer, NullMeter, UsageMeter};
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus};
use crate::ids::{PlanId, SubscriberId};
use crate::ledger::{Voucher, VoucherLedger, VoucherState, VoucherStats};
use crate::session::{
    RecoveryReport, SessionConfig, SessionManager, SessionSnapshot, SessionState,
};
use crate::storage::RecordStore;

/// Figures for the admin dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub plans: usize,
    pub subscribers: usize,
    pub vouchers: VoucherStats,
    /// Sum of the plan prices of redeemed vouchers
    pub redeemed_value_cents: u64,
    pub live_sessions: usize,
    pub ended_sessions: usize,
    pub data_used_bytes: u64,
    pub time_used_seconds: u64,
}

/// Assembles an [`Engine`] from its collaborators
pub struct EngineBuilder {
    catalog: PlanCatalog,
    enforcer: Arc<dyn AccessEnforcer>,
    meter: Arc<dyn UsageMeter>,
    clock: Arc<dyn Clock>,
    sessions: SessionConfig,
    state_dir: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn enforcer(mut self, enforcer: Arc<dyn AccessEnforcer>) -> Self {
        self.enforcer = enforcer;
        self
    }

    pub fn meter(mut self, meter: Arc<dyn UsageMeter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.sessions = config;
        self
    }

    /// Persist state under `dir`; without it nothing survives the process
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Load persisted balances and vouchers.
    ///
    /// Sessions are loaded by [`Engine::recover`], which also restarts them.
    pub fn build(self) -> Result<Engine> {
        let events = EventBus::new();

        let (balance_store, voucher_store, session_store) = match &self.state_dir {
            Some(dir) => (
                RecordStore::open(dir, "balances")?,
                RecordStore::open(dir, "vouchers")?,
                RecordStore::open(dir, "sessions")?,
            ),
            None => (
                RecordStore::in_memory("balances"),
                RecordStore::in_memory("vouchers"),
                RecordStore::in_memory("sessions"),
            ),
        };

        let balances = Arc::new(
            BalanceStore::load(balance_store, self.clock.clone(), events.clone())
                .context("Failed to load balances")?,
        );

        let ledger = VoucherLedger::load(
            voucher_store,
            self.catalog.clone(),
            balances.clone(),
            self.clock.clone(),
            events.clone(),
        )
        .context("Failed to load vouchers")?;

        let sessions = SessionManager::new(
            balances.clone(),
            self.enforcer,
            self.meter,
            self.clock,
            session_store,
            events.clone(),
            self.sessions,
        );

        match &self.state_dir {
            Some(dir) => info!("Engine state directory: {}", dir.display()),
            None => info!("Engine running without persistence"),
        }

        Ok(Engine {
            catalog: self.catalog,
            balances,
            ledger,
            sessions,
            events,
        })
    }
}

/// Entry point for the presentation layer
pub struct Engine {
    catalog: PlanCatalog,
    balances: Arc<BalanceStore>,
    ledger: VoucherLedger,
    sessions: SessionManager,
    events: EventBus,
}

impl Engine {
    /// Builder with a log-only enforcer, no usage meter and the system clock
    pub fn builder(catalog: PlanCatalog) -> EngineBuilder {
        EngineBuilder {
            catalog,
            enforcer: Arc::new(LogOnlyEnforcer),
            meter: Arc::new(NullMeter),
            clock: Arc::new(SystemClock),
            sessions: SessionConfig::default(),
            state_dir: None,
        }
    }

    /// Engine persisting under `state_dir` with default collaborators
    pub fn open(catalog: PlanCatalog, state_dir: &Path) -> Result<Self> {
        Self::builder(catalog).state_dir(state_dir).build()
    }

    /// Resume persisted sessions
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.sessions.recover().await
    }

    /// Load persisted sessions for reporting without resuming them
    pub async fn load_sessions(&self) -> Result<RecoveryReport> {
        self.sessions.load().await
    }

    /// Stop all session drivers; sessions resume on the next `recover`
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    pub fn plans(&self) -> Vec<Arc<Plan>> {
        self.catalog.plans()
    }

    pub async fn start_session(&self, subscriber: &SubscriberId) -> EngineResult<SessionSnapshot> {
        self.sessions.start(subscriber).await
    }

    /// Start a session and wait for the access grant to settle
    pub async fn start_session_and_wait(
        &self,
        subscriber: &SubscriberId,
    ) -> EngineResult<SessionSnapshot> {
        self.sessions.start_and_wait(subscriber).await
    }

    pub async fn stop_session(&self, subscriber: &SubscriberId) -> EngineResult<SessionSnapshot> {
        self.sessions.stop(subscriber).await
    }

    pub async fn admin_revoke(&self, subscriber: &SubscriberId) -> EngineResult<SessionSnapshot> {
        self.sessions.admin_revoke(subscriber).await
    }

    pub async fn redeem_voucher(
        &self,
        code: &str,
        subscriber: &SubscriberId,
    ) -> EngineResult<Arc<Plan>> {
        self.ledger.redeem(code, subscriber).await
    }

    pub async fn issue_vouchers(&self, plan_id: &PlanId, count: usize) -> EngineResult<Vec<Voucher>> {
        self.ledger.issue(plan_id, count).await
    }

    pub async fn revoke_voucher(&self, code: &str) -> EngineResult<Voucher> {
        self.ledger.revoke(code).await
    }

    pub async fn delete_voucher(&self, code: &str) -> EngineResult<()> {
        self.ledger.delete(code).await
    }

    pub async fn voucher(&self, code: &str) -> Option<Voucher> {
        self.ledger.get(code).await
    }

    pub async fn vouchers(&self) -> Vec<Voucher> {
        self.ledger.list().await
    }

    pub async fn read_balance(&self, subscriber: &SubscriberId) -> Balance {
        self.balances.read(subscriber).await
    }

    pub async fn subscribers(&self) -> Vec<SubscriberId> {
        self.balances.subscribers().await
    }

    pub async fn session(&self, subscriber: &SubscriberId) -> Option<SessionSnapshot> {
        self.sessions.session(subscriber).await
    }

    pub async fn session_state(&self, subscriber: &SubscriberId) -> SessionState {
        self.sessions.state(subscriber).await
    }

    pub async fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.active_sessions().await
    }

    pub async fn history(&self, subscriber: Option<&SubscriberId>) -> Vec<SessionSnapshot> {
        self.sessions.history(subscriber).await
    }

    /// Every balance, voucher and session change
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Follow the subscriber's latest session
    pub async fn watch_session(
        &self,
        subscriber: &SubscriberId,
    ) -> Option<watch::Receiver<SessionSnapshot>> {
        self.sessions.watch(subscriber).await
    }

    pub async fn stats(&self) -> EngineStats {
        let vouchers = self.ledger.list().await;
        let live = self.sessions.active_sessions().await;
        let ended = self.sessions.history(None).await;

        let mut stats = EngineStats {
            plans: self.catalog.len(),
            subscribers: self.balances.subscribers().await.len(),
            vouchers: self.ledger.stats().await,
            live_sessions: live.len(),
            ended_sessions: ended.len(),
            ..Default::default()
        };

        stats.redeemed_value_cents = vouchers
            .iter()
            .filter(|v| v.state == VoucherState::Redeemed)
            .filter_map(|v| self.catalog.get(&v.plan_id))
            .map(|p| p.price_cents)
            .sum();

        for session in live.iter().chain(ended.iter()) {
            stats.data_used_bytes = stats.data_used_bytes.saturating_add(session.usage.data_bytes);
            stats.time_used_seconds = stats
                .time_used_seconds
                .saturating_add(session.usage.time_seconds);
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::quota::Allowance;
    use crate::session::EndReason;
    use crate::testing::{ScriptedEnforcer, test_session_config, wait_for_state};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn catalog() -> PlanCatalog {
        PlanCatalog::new(vec![Plan {
            id: PlanId::from("daily-1gb"),
            name: "Daily 1 GB".to_string(),
            description: String::new(),
            data: Allowance::Limited(GIB),
            time: Allowance::Limited(24 * 3600),
            price_cents: 300,
            validity_days: 1,
            active: true,
        }])
        .unwrap()
    }

    fn engine(clock: &ManualClock) -> (Engine, Arc<ScriptedEnforcer>) {
        let enforcer = Arc::new(ScriptedEnforcer::default());
        let engine = Engine::builder(catalog())
            .enforcer(enforcer.clone())
            .meter(enforcer.clone())
            .clock(Arc::new(clock.clone()))
            .session_config(test_session_config())
            .build()
            .unwrap();
        (engine, enforcer)
    }

    #[tokio::test(start_paused = true)]
    async fn voucher_to_time_exhaustion() {
        let clock = ManualClock::default();
        let (engine, _) = engine(&clock);
        let alice = SubscriberId::from("alice");

        let code = engine
            .issue_vouchers(&PlanId::from("daily-1gb"), 1)
            .await
            .unwrap()[0]
            .code
            .clone();
        engine.redeem_voucher(&code, &alice).await.unwrap();

        engine.start_session(&alice).await.unwrap();
        let mut rx = engine.watch_session(&alice).await.unwrap();
        wait_for_state(&mut rx, SessionState::Active).await;

        // A full day passes with no traffic
        clock.advance(chrono::Duration::hours(24));
        let ended = wait_for_state(&mut rx, SessionState::Ended).await;

        assert_eq!(ended.end_reason, Some(EndReason::TimeExhausted));
        assert_eq!(ended.usage.time_seconds, 24 * 3600);
        assert_eq!(ended.usage.data_bytes, 0);

        let balance = engine.read_balance(&alice).await;
        assert_eq!(balance.time, Allowance::ZERO);
        assert_eq!(balance.data, Allowance::Limited(GIB));
        assert_eq!(engine.session_state(&alice).await, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_start_surfaces_enforcement_failure() {
        let clock = ManualClock::default();
        let (engine, enforcer) = engine(&clock);
        let alice = SubscriberId::from("alice");

        let code = engine
            .issue_vouchers(&PlanId::from("daily-1gb"), 1)
            .await
            .unwrap()[0]
            .code
            .clone();
        engine.redeem_voucher(&code, &alice).await.unwrap();

        enforcer.fail_grants(u32::MAX);
        let err = engine.start_session_and_wait(&alice).await.unwrap_err();
        assert_eq!(err.category(), "enforcement_failure");
        assert!(err.to_string().contains("grant failed after"));
        assert_eq!(engine.history(Some(&alice)).await.len(), 1);

        enforcer.fail_grants(0);
        let active = engine.start_session_and_wait(&alice).await.unwrap();
        assert_eq!(active.state, SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_activity() {
        let clock = ManualClock::default();
        let (engine, enforcer) = engine(&clock);
        let alice = SubscriberId::from("alice");

        let vouchers = engine
            .issue_vouchers(&PlanId::from("daily-1gb"), 3)
            .await
            .unwrap();
        engine.redeem_voucher(&vouchers[0].code, &alice).await.unwrap();
        engine.revoke_voucher(&vouchers[1].code).await.unwrap();

        engine.start_session(&alice).await.unwrap();
        let mut rx = engine.watch_session(&alice).await.unwrap();
        wait_for_state(&mut rx, SessionState::Active).await;

        clock.advance(chrono::Duration::minutes(10));
        enforcer.set_bytes(2_048);
        engine.stop_session(&alice).await.unwrap();
        wait_for_state(&mut rx, SessionState::Ended).await;

        let stats = engine.stats().await;
        assert_eq!(stats.plans, 1);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(
            stats.vouchers,
            VoucherStats {
                total: 3,
                unredeemed: 1,
                redeemed: 1,
                revoked: 1
            }
        );
        assert_eq!(stats.redeemed_value_cents, 300);
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.ended_sessions, 1);
        assert_eq!(stats.data_used_bytes, 2_048);
        assert_eq!(stats.time_used_seconds, 600);
    }

    #[tokio::test]
    async fn events_follow_redemption() {
        let clock = ManualClock::default();
        let (engine, _) = engine(&clock);
        let mut events = engine.subscribe();
        let alice = SubscriberId::from("alice");

        let code = engine
            .issue_vouchers(&PlanId::from("daily-1gb"), 1)
            .await
            .unwrap()[0]
            .code
            .clone();
        engine.redeem_voucher(&code, &alice).await.unwrap();

        match events.recv().await.unwrap() {
            EngineEvent::BalanceChanged(balance) => assert_eq!(balance.subscriber, alice),
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await.unwrap() {
            EngineEvent::VoucherRedeemed { code: redeemed, .. } => assert_eq!(redeemed, code),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let alice = SubscriberId::from("alice");

        let code = {
            let engine = Engine::open(catalog(), temp.path()).unwrap();
            let vouchers = engine
                .issue_vouchers(&PlanId::from("daily-1gb"), 2)
                .await
                .unwrap();
            engine.redeem_voucher(&vouchers[0].code, &alice).await.unwrap();
            vouchers[1].code.clone()
        };

        let engine = Engine::open(catalog(), temp.path()).unwrap();
        engine.recover().await.unwrap();
        assert_eq!(engine.vouchers().await.len(), 2);
        assert_eq!(
            engine.read_balance(&alice).await.data,
            Allowance::Limited(GIB)
        );
        assert_eq!(
            engine.voucher(&code).await.unwrap().state,
            VoucherState::Unredeemed
        );
    }
}
