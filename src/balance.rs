use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::EngineResult;
use crate::events::{EngineEvent, EventBus};
use crate::ids::SubscriberId;
use crate::quota::Allowance;
use crate::storage::RecordStore;

/// A subscriber's remaining allowance
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Balance {
    pub subscriber: SubscriberId,
    /// Remaining data in bytes
    pub data: Allowance,
    /// Remaining time in seconds
    pub time: Allowance,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// Zero balance for a subscriber that has never been credited
    pub fn empty(subscriber: SubscriberId, now: DateTime<Utc>) -> Self {
        Self {
            subscriber,
            data: Allowance::ZERO,
            time: Allowance::ZERO,
            updated_at: now,
        }
    }

    /// Enough left on both axes to run a session
    pub fn can_start_session(&self) -> bool {
        !self.data.is_exhausted() && !self.time.is_exhausted()
    }
}

/// Per-subscriber balances.
///
/// Each subscriber has its own lock, so credits and debits for one
/// subscriber are serialized while different subscribers proceed in
/// parallel. Every change is persisted before it is committed in memory.
pub struct BalanceStore {
    accounts: RwLock<HashMap<SubscriberId, Arc<Mutex<Balance>>>>,
    store: RecordStore<Balance>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl BalanceStore {
    /// Load all persisted balances
    pub fn load(store: RecordStore<Balance>, clock: Arc<dyn Clock>, events: EventBus) -> Result<Self> {
        let accounts: HashMap<_, _> = store
            .load_all()?
            .into_iter()
            .map(|b| (b.subscriber.clone(), Arc::new(Mutex::new(b))))
            .collect();

        if !accounts.is_empty() {
            info!("Loaded {} subscriber balances", accounts.len());
        }

        Ok(Self {
            accounts: RwLock::new(accounts),
            store,
            clock,
            events,
        })
    }

    /// Point-in-time snapshot of a subscriber's balance
    pub async fn read(&self, subscriber: &SubscriberId) -> Balance {
        let account = self.accounts.read().await.get(subscriber).cloned();
        match account {
            Some(account) => account.lock().await.clone(),
            None => Balance::empty(subscriber.clone(), self.clock.now()),
        }
    }

    /// Add allowance to a subscriber's balance.
    ///
    /// A subscriber is only registered once their first credit is on disk.
    pub async fn credit(
        &self,
        subscriber: &SubscriberId,
        data: Allowance,
        time: Allowance,
    ) -> EngineResult<Balance> {
        let credited = |balance: &Balance| Balance {
            subscriber: subscriber.clone(),
            data: balance.data.credit(data),
            time: balance.time.credit(time),
            updated_at: self.clock.now(),
        };

        let existing = self.accounts.read().await.get(subscriber).cloned();
        let account = match existing {
            Some(account) => account,
            None => {
                let mut accounts = self.accounts.write().await;
                match accounts.get(subscriber).cloned() {
                    Some(account) => account,
                    None => {
                        let mut balance = Balance::empty(subscriber.clone(), self.clock.now());
                        let updated = credited(&balance);
                        self.commit(&mut balance, updated)?;
                        accounts.insert(subscriber.clone(), Arc::new(Mutex::new(balance.clone())));

                        info!("New subscriber {} credited", subscriber);
                        return Ok(balance);
                    }
                }
            }
        };

        let mut balance = account.lock().await;
        let updated = credited(&balance);
        self.commit(&mut balance, updated)?;

        info!(
            "Credited {}: data {}, time {}",
            subscriber,
            balance.data.display_bytes(),
            balance.time.display_duration()
        );
        Ok(balance.clone())
    }

    /// Subtract usage from a subscriber's balance, flooring at zero.
    ///
    /// Returns the post-debit balance so the caller can detect exhaustion
    /// without a second read.
    pub async fn debit(
        &self,
        subscriber: &SubscriberId,
        data_bytes: u64,
        time_seconds: u64,
    ) -> EngineResult<Balance> {
        // Nothing to charge against
        let Some(account) = self.accounts.read().await.get(subscriber).cloned() else {
            return Ok(Balance::empty(subscriber.clone(), self.clock.now()));
        };
        let mut balance = account.lock().await;

        let updated = Balance {
            subscriber: subscriber.clone(),
            data: balance.data.debit(data_bytes),
            time: balance.time.debit(time_seconds),
            updated_at: self.clock.now(),
        };
        self.commit(&mut balance, updated)?;

        debug!(
            "Debited {}: {} bytes, {}s (remaining data {}, time {})",
            subscriber,
            data_bytes,
            time_seconds,
            balance.data.display_bytes(),
            balance.time.display_duration()
        );
        Ok(balance.clone())
    }

    /// Subscribers that have a balance record
    pub async fn subscribers(&self) -> Vec<SubscriberId> {
        let mut ids: Vec<_> = self.accounts.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn commit(&self, current: &mut Balance, updated: Balance) -> EngineResult<()> {
        self.store.put(updated.subscriber.as_str(), &updated)?;
        *current = updated;
        self.events.publish(EngineEvent::BalanceChanged(current.clone()));
        Ok(())
    }
}
