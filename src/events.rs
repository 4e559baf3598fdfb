use tokio::sync::broadcast;

use crate::balance::Balance;
use crate::ids::{PlanId, SubscriberId};
use crate::session::SessionSnapshot;

/// Capacity of the engine event channel; slow subscribers see `Lagged`
pub const EVENT_CAPACITY: usize = 256;

/// Status changes pushed to the presentation layer
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A subscriber's balance was credited or debited
    BalanceChanged(Balance),

    /// A session changed state or accrued usage
    SessionChanged(SessionSnapshot),

    /// A voucher was redeemed
    VoucherRedeemed {
        code: String,
        subscriber: SubscriberId,
        plan_id: PlanId,
    },
}

impl EngineEvent {
    /// Subscriber the event concerns
    pub fn subscriber(&self) -> &SubscriberId {
        match self {
            EngineEvent::BalanceChanged(balance) => &balance.subscriber,
            EngineEvent::SessionChanged(snapshot) => &snapshot.subscriber,
            EngineEvent::VoucherRedeemed { subscriber, .. } => subscriber,
        }
    }
}

/// Sending half shared by every engine component
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no listeners is fine
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
