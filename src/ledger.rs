use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::balance::BalanceStore;
use crate::catalog::{Plan, PlanCatalog};
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::ids::{PlanId, SubscriberId};
use crate::storage::RecordStore;

/// Prefix of every generated voucher code
pub const CODE_PREFIX: &str = "WIFI";

/// Random characters after the prefix
const CODE_RANDOM_LEN: usize = 8;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Most vouchers a single `issue` call may generate
pub const MAX_ISSUE_BATCH: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherState {
    Unredeemed,
    Redeemed,
    Revoked,
}

/// A single-use code redeemable for a plan's allowance
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Voucher {
    pub code: String,
    pub plan_id: PlanId,
    pub state: VoucherState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_by: Option<SubscriberId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Voucher {
    fn new(code: String, plan_id: PlanId, now: DateTime<Utc>) -> Self {
        Self {
            code,
            plan_id,
            state: VoucherState::Unredeemed,
            created_at: now,
            redeemed_by: None,
            redeemed_at: None,
            revoked_at: None,
        }
    }
}

/// Voucher counts for the admin dashboard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VoucherStats {
    pub total: usize,
    pub unredeemed: usize,
    pub redeemed: usize,
    pub revoked: usize,
}

/// `None` once the voucher has been deleted, so a redeemer that looked the
/// code up just before deletion cannot resurrect it.
type VoucherSlot = Arc<Mutex<Option<Voucher>>>;

/// Maps voucher codes to plans and guarantees each code is redeemed at most once
pub struct VoucherLedger {
    vouchers: RwLock<HashMap<String, VoucherSlot>>,
    catalog: PlanCatalog,
    balances: Arc<BalanceStore>,
    store: RecordStore<Voucher>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl VoucherLedger {
    /// Load all persisted vouchers
    pub fn load(
        store: RecordStore<Voucher>,
        catalog: PlanCatalog,
        balances: Arc<BalanceStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self> {
        let vouchers: HashMap<_, _> = store
            .load_all()?
            .into_iter()
            .map(|v| (v.code.clone(), Arc::new(Mutex::new(Some(v)))))
            .collect();

        if !vouchers.is_empty() {
            info!("Loaded {} vouchers", vouchers.len());
        }

        Ok(Self {
            vouchers: RwLock::new(vouchers),
            catalog,
            balances,
            store,
            clock,
            events,
        })
    }

    /// Generate `count` fresh vouchers for a plan.
    ///
    /// All-or-nothing: if any voucher cannot be persisted, the ones already
    /// written by this call are removed again. Codes are reserved under the
    /// registry lock, but written outside it, so a large batch does not hold
    /// up redemptions.
    pub async fn issue(&self, plan_id: &PlanId, count: usize) -> EngineResult<Vec<Voucher>> {
        if count == 0 || count > MAX_ISSUE_BATCH {
            return Err(EngineError::InvalidIssueCount {
                requested: count,
                max: MAX_ISSUE_BATCH,
            });
        }

        let plan = self
            .catalog
            .get(plan_id)
            .filter(|p| p.active)
            .ok_or_else(|| EngineError::InvalidPlan {
                plan_id: plan_id.clone(),
            })?;

        let reserved = self.reserve_codes(count).await;
        let now = self.clock.now();
        let mut issued: Vec<Voucher> = Vec::with_capacity(count);

        for (code, _) in &reserved {
            let voucher = Voucher::new(code.clone(), plan.id.clone(), now);
            if let Err(e) = self.store.put(code, &voucher) {
                error!("Failed to persist voucher, rolling back {} issued", issued.len());
                self.release(&reserved, &issued).await;
                return Err(e);
            }
            issued.push(voucher);
        }

        // The batch only becomes visible once all of it is on disk
        for ((_, slot), voucher) in reserved.iter().zip(&issued) {
            *slot.lock().await = Some(voucher.clone());
        }

        info!("Issued {} vouchers for plan {}", issued.len(), plan.id);
        Ok(issued)
    }

    /// Claim `count` unused codes. A reserved slot stays empty, and so reads
    /// as not found, until `issue` fills it.
    async fn reserve_codes(&self, count: usize) -> Vec<(String, VoucherSlot)> {
        let mut vouchers = self.vouchers.write().await;
        let mut reserved = Vec::with_capacity(count);

        while reserved.len() < count {
            let code = generate_voucher_code();
            if let Entry::Vacant(entry) = vouchers.entry(code.clone()) {
                let slot: VoucherSlot = Arc::new(Mutex::new(None));
                entry.insert(slot.clone());
                reserved.push((code, slot));
            }
        }

        reserved
    }

    /// Undo a failed batch: drop written records and free the reserved codes
    async fn release(&self, reserved: &[(String, VoucherSlot)], written: &[Voucher]) {
        for voucher in written {
            if let Err(e) = self.store.remove(&voucher.code) {
                warn!("Failed to roll back voucher {}: {}", voucher.code, e);
            }
        }

        let mut vouchers = self.vouchers.write().await;
        for (code, _) in reserved {
            vouchers.remove(code);
        }
    }

    /// Redeem a voucher and credit the subscriber with its plan allowance.
    ///
    /// The state check and transition happen under the voucher's own lock,
    /// so concurrent attempts on one code yield exactly one success.
    pub async fn redeem(&self, code: &str, subscriber: &SubscriberId) -> EngineResult<Arc<Plan>> {
        let code = normalize_code(code);
        let slot = self.slot(&code).await?;
        let mut guard = slot.lock().await;
        let voucher = guard
            .as_mut()
            .ok_or_else(|| EngineError::VoucherNotFound { code: code.clone() })?;

        match voucher.state {
            VoucherState::Unredeemed => {}
            VoucherState::Redeemed => {
                return Err(EngineError::VoucherAlreadyRedeemed { code });
            }
            VoucherState::Revoked => {
                return Err(EngineError::VoucherRevoked { code });
            }
        }

        let plan = self
            .catalog
            .get(&voucher.plan_id)
            .ok_or_else(|| EngineError::InvalidPlan {
                plan_id: voucher.plan_id.clone(),
            })?;

        let redeemed = Voucher {
            state: VoucherState::Redeemed,
            redeemed_by: Some(subscriber.clone()),
            redeemed_at: Some(self.clock.now()),
            ..voucher.clone()
        };

        // Mark the code used durably before crediting, so a crash between
        // the two steps can never lead to a second credit.
        self.store.put(&code, &redeemed)?;

        if let Err(e) = self.balances.credit(subscriber, plan.data, plan.time).await {
            if let Err(revert_err) = self.store.put(&code, voucher) {
                error!("Failed to revert voucher {} after credit failure: {}", code, revert_err);
            }
            return Err(e);
        }

        *voucher = redeemed;
        info!("Voucher {} redeemed by {} for plan {}", code, subscriber, plan.id);
        self.events.publish(EngineEvent::VoucherRedeemed {
            code,
            subscriber: subscriber.clone(),
            plan_id: plan.id.clone(),
        });

        Ok(plan)
    }

    /// Withdraw an unredeemed voucher; revoking twice is a no-op
    pub async fn revoke(&self, code: &str) -> EngineResult<Voucher> {
        let code = normalize_code(code);
        let slot = self.slot(&code).await?;
        let mut guard = slot.lock().await;
        let voucher = guard
            .as_mut()
            .ok_or_else(|| EngineError::VoucherNotFound { code: code.clone() })?;

        match voucher.state {
            VoucherState::Revoked => return Ok(voucher.clone()),
            VoucherState::Redeemed => {
                return Err(EngineError::VoucherAlreadyRedeemed { code });
            }
            VoucherState::Unredeemed => {}
        }

        let revoked = Voucher {
            state: VoucherState::Revoked,
            revoked_at: Some(self.clock.now()),
            ..voucher.clone()
        };
        self.store.put(&code, &revoked)?;
        *voucher = revoked;

        info!("Voucher {} revoked", code);
        Ok(voucher.clone())
    }

    /// Delete a voucher that was never redeemed
    pub async fn delete(&self, code: &str) -> EngineResult<()> {
        let code = normalize_code(code);
        let mut vouchers = self.vouchers.write().await;
        let slot = vouchers
            .get(&code)
            .cloned()
            .ok_or_else(|| EngineError::VoucherNotFound { code: code.clone() })?;

        let mut guard = slot.lock().await;
        match guard.as_ref().map(|v| v.state) {
            None => return Err(EngineError::VoucherNotFound { code }),
            Some(VoucherState::Redeemed) => {
                return Err(EngineError::VoucherAlreadyRedeemed { code });
            }
            Some(VoucherState::Unredeemed | VoucherState::Revoked) => {}
        }

        self.store.remove(&code)?;
        *guard = None;
        vouchers.remove(&code);

        info!("Voucher {} deleted", code);
        Ok(())
    }

    /// Look up a voucher by code
    pub async fn get(&self, code: &str) -> Option<Voucher> {
        let slot = self.vouchers.read().await.get(&normalize_code(code)).cloned()?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// All vouchers, newest first
    pub async fn list(&self) -> Vec<Voucher> {
        let slots: Vec<_> = self.vouchers.read().await.values().cloned().collect();

        let mut vouchers = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(voucher) = slot.lock().await.clone() {
                vouchers.push(voucher);
            }
        }

        vouchers.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.code.cmp(&b.code)));
        vouchers
    }

    pub async fn stats(&self) -> VoucherStats {
        let mut stats = VoucherStats::default();
        for voucher in self.list().await {
            stats.total += 1;
            match voucher.state {
                VoucherState::Unredeemed => stats.unredeemed += 1,
                VoucherState::Redeemed => stats.redeemed += 1,
                VoucherState::Revoked => stats.revoked += 1,
            }
        }
        stats
    }

    async fn slot(&self, code: &str) -> EngineResult<VoucherSlot> {
        self.vouchers
            .read()
            .await
            .get(code)
            .cloned()
            .ok_or_else(|| EngineError::VoucherNotFound {
                code: code.to_string(),
            })
    }
}

/// Generate an unpredictable voucher code from the OS CSPRNG
pub fn generate_voucher_code() -> String {
    let mut rng = OsRng;
    let suffix: String = (0..CODE_RANDOM_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", CODE_PREFIX, suffix)
}

/// Codes are matched case-insensitively, ignoring surrounding whitespace
fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::quota::Allowance;
    use std::collections::HashSet;

    fn make_catalog() -> PlanCatalog {
        PlanCatalog::new(vec![
            Plan {
                id: PlanId::from("daily"),
                name: "Daily".to_string(),
                description: String::new(),
                data: Allowance::Limited(1_000),
                time: Allowance::Limited(86_400),
                price_cents: 300,
                validity_days: 1,
                active: true,
            },
            Plan {
                id: PlanId::from("retired"),
                name: "Retired".to_string(),
                description: String::new(),
                data: Allowance::Unlimited,
                time: Allowance::Limited(60),
                price_cents: 100,
                validity_days: 1,
                active: false,
            },
        ])
        .unwrap()
    }

    fn make_ledger() -> (VoucherLedger, Arc<BalanceStore>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::new();
        let balances = Arc::new(
            BalanceStore::load(RecordStore::in_memory("balances"), clock.clone(), events.clone())
                .unwrap(),
        );
        let ledger = VoucherLedger::load(
            RecordStore::in_memory("vouchers"),
            make_catalog(),
            balances.clone(),
            clock,
            events,
        )
        .unwrap();
        (ledger, balances)
    }

    #[test]
    fn generated_codes_have_expected_shape() {
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let code = generate_voucher_code();
            assert!(code.starts_with(CODE_PREFIX));
            assert_eq!(code.len(), CODE_PREFIX.len() + CODE_RANDOM_LEN);
            assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
            seen.insert(code);
        }
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn issue_creates_unredeemed_vouchers() {
        let (ledger, _) = make_ledger();
        let vouchers = ledger.issue(&PlanId::from("daily"), 5).await.unwrap();

        assert_eq!(vouchers.len(), 5);
        assert!(vouchers.iter().all(|v| v.state == VoucherState::Unredeemed));
        assert_eq!(ledger.stats().await.unredeemed, 5);
    }

    #[tokio::test]
    async fn issue_rejects_unknown_and_inactive_plans() {
        let (ledger, _) = make_ledger();

        let err = ledger.issue(&PlanId::from("nope"), 1).await.unwrap_err();
        assert_eq!(err.category(), "invalid_plan");

        let err = ledger.issue(&PlanId::from("retired"), 1).await.unwrap_err();
        assert_eq!(err.category(), "invalid_plan");
    }

    #[tokio::test]
    async fn issue_count_is_bounded() {
        let (ledger, _) = make_ledger();

        for count in [0, MAX_ISSUE_BATCH + 1, usize::MAX] {
            let err = ledger.issue(&PlanId::from("daily"), count).await.unwrap_err();
            assert_eq!(err.category(), "invalid_issue_count");
        }
        assert!(ledger.list().await.is_empty());

        let batch = ledger.issue(&PlanId::from("daily"), MAX_ISSUE_BATCH).await.unwrap();
        assert_eq!(batch.len(), MAX_ISSUE_BATCH);
    }

    #[tokio::test]
    async fn failed_issue_releases_reserved_codes() {
        let temp = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::new();
        let balances = Arc::new(
            BalanceStore::load(RecordStore::in_memory("balances"), clock.clone(), events.clone())
                .unwrap(),
        );
        let ledger = VoucherLedger::load(
            RecordStore::open(temp.path(), "vouchers").unwrap(),
            make_catalog(),
            balances,
            clock,
            events,
        )
        .unwrap();

        std::fs::remove_dir_all(temp.path().join("vouchers")).unwrap();
        std::fs::write(temp.path().join("vouchers"), "blocked").unwrap();

        let err = ledger.issue(&PlanId::from("daily"), 3).await.unwrap_err();
        assert_eq!(err.category(), "storage_unavailable");
        assert!(ledger.vouchers.read().await.is_empty());
        assert_eq!(ledger.stats().await, VoucherStats::default());
    }

    #[tokio::test]
    async fn redeem_credits_balance_once() {
        let (ledger, balances) = make_ledger();
        let alice = SubscriberId::from("alice");
        let code = ledger.issue(&PlanId::from("daily"), 1).await.unwrap()[0]
            .code
            .clone();

        let plan = ledger.redeem(&code.to_lowercase(), &alice).await.unwrap();
        assert_eq!(plan.id, PlanId::from("daily"));

        let err = ledger.redeem(&code, &alice).await.unwrap_err();
        assert_eq!(err.category(), "voucher_already_redeemed");

        let balance = balances.read(&alice).await;
        assert_eq!(balance.data, Allowance::Limited(1_000));
        assert_eq!(balance.time, Allowance::Limited(86_400));

        let voucher = ledger.get(&code).await.unwrap();
        assert_eq!(voucher.state, VoucherState::Redeemed);
        assert_eq!(voucher.redeemed_by, Some(alice));
        assert!(voucher.redeemed_at.is_some());
    }

    #[tokio::test]
    async fn redeem_unknown_code_fails() {
        let (ledger, _) = make_ledger();
        let err = ledger
            .redeem("WIFIXXXXXXXX", &SubscriberId::from("alice"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "voucher_not_found");
    }

    #[tokio::test]
    async fn revoked_voucher_cannot_be_redeemed() {
        let (ledger, balances) = make_ledger();
        let alice = SubscriberId::from("alice");
        let code = ledger.issue(&PlanId::from("daily"), 1).await.unwrap()[0]
            .code
            .clone();

        ledger.revoke(&code).await.unwrap();
        let again = ledger.revoke(&code).await.unwrap();
        assert_eq!(again.state, VoucherState::Revoked);

        let err = ledger.redeem(&code, &alice).await.unwrap_err();
        assert_eq!(err.category(), "voucher_revoked");
        assert!(!balances.read(&alice).await.can_start_session());
    }

    #[tokio::test]
    async fn delete_only_removes_unredeemed() {
        let (ledger, _) = make_ledger();
        let alice = SubscriberId::from("alice");
        let vouchers = ledger.issue(&PlanId::from("daily"), 2).await.unwrap();

        ledger.delete(&vouchers[0].code).await.unwrap();
        assert!(ledger.get(&vouchers[0].code).await.is_none());
        let err = ledger.redeem(&vouchers[0].code, &alice).await.unwrap_err();
        assert_eq!(err.category(), "voucher_not_found");

        ledger.redeem(&vouchers[1].code, &alice).await.unwrap();
        let err = ledger.delete(&vouchers[1].code).await.unwrap_err();
        assert_eq!(err.category(), "voucher_already_redeemed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redemption_succeeds_exactly_once() {
        let (ledger, balances) = make_ledger();
        let ledger = Arc::new(ledger);

        for round in 0..25 {
            let code = ledger.issue(&PlanId::from("daily"), 1).await.unwrap()[0]
                .code
                .clone();
            let first = SubscriberId::from(format!("first-{}", round));
            let second = SubscriberId::from(format!("second-{}", round));

            let a = {
                let ledger = ledger.clone();
                let code = code.clone();
                let first = first.clone();
                tokio::spawn(async move { ledger.redeem(&code, &first).await })
            };
            let b = {
                let ledger = ledger.clone();
                let code = code.clone();
                let second = second.clone();
                tokio::spawn(async move { ledger.redeem(&code, &second).await })
            };

            let results = [a.await.unwrap(), b.await.unwrap()];
            let successes = results.iter().filter(|r| r.is_ok()).count();
            let lost: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

            assert_eq!(successes, 1);
            assert_eq!(lost.len(), 1);
            assert_eq!(lost[0].category(), "voucher_already_redeemed");

            // Exactly one of the two subscribers was credited, exactly once
            let mut total = 0;
            for subscriber in [&first, &second] {
                if let Allowance::Limited(bytes) = balances.read(subscriber).await.data {
                    total += bytes;
                }
            }
            assert_eq!(total, 1_000);
        }
    }

    #[tokio::test]
    async fn vouchers_survive_reload() {
        let temp = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::new();
        let balances = Arc::new(
            BalanceStore::load(RecordStore::in_memory("balances"), clock.clone(), events.clone())
                .unwrap(),
        );

        let code = {
            let ledger = VoucherLedger::load(
                RecordStore::open(temp.path(), "vouchers").unwrap(),
                make_catalog(),
                balances.clone(),
                clock.clone(),
                events.clone(),
            )
            .unwrap();
            let code = ledger.issue(&PlanId::from("daily"), 1).await.unwrap()[0]
                .code
                .clone();
            ledger.redeem(&code, &SubscriberId::from("alice")).await.unwrap();
            code
        };

        let ledger = VoucherLedger::load(
            RecordStore::open(temp.path(), "vouchers").unwrap(),
            make_catalog(),
            balances,
            clock,
            events,
        )
        .unwrap();
        let err = ledger
            .redeem(&code, &SubscriberId::from("bob"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "voucher_already_redeemed");
    }

    #[tokio::test]
    async fn failed_credit_leaves_voucher_unredeemed() {
        let temp = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = EventBus::new();
        let balances = Arc::new(
            BalanceStore::load(
                RecordStore::open(temp.path(), "balances").unwrap(),
                clock.clone(),
                events.clone(),
            )
            .unwrap(),
        );
        let ledger = VoucherLedger::load(
            RecordStore::open(temp.path(), "vouchers").unwrap(),
            make_catalog(),
            balances.clone(),
            clock,
            events,
        )
        .unwrap();
        let code = ledger.issue(&PlanId::from("daily"), 1).await.unwrap()[0]
            .code
            .clone();

        // Break only the balance store
        std::fs::remove_dir_all(temp.path().join("balances")).unwrap();
        std::fs::write(temp.path().join("balances"), "blocked").unwrap();

        let alice = SubscriberId::from("alice");
        let err = ledger.redeem(&code, &alice).await.unwrap_err();
        assert_eq!(err.category(), "storage_unavailable");

        let voucher = ledger.get(&code).await.unwrap();
        assert_eq!(voucher.state, VoucherState::Unredeemed);
        assert!(!balances.read(&alice).await.can_start_session());
        assert!(balances.subscribers().await.is_empty());
    }
}
