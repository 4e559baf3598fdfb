// Access enforcement collaborators
//
// The engine never touches the network path itself. It tells an access
// enforcer (a network-access controller) when to grant and revoke a
// subscriber's access, and reads per-session traffic from a usage meter.

pub mod http;
pub mod log_only;

use anyhow::Result;
use async_trait::async_trait;

use crate::ids::{SessionId, SubscriberId};

pub use http::HttpEnforcer;
pub use log_only::LogOnlyEnforcer;

/// Grants and revokes network access for a session.
///
/// Returning `Ok` is the confirmation; an error is a failure the engine will
/// retry with backoff.
#[async_trait]
pub trait AccessEnforcer: Send + Sync {
    async fn grant(&self, subscriber: &SubscriberId, session_id: &SessionId) -> Result<()>;

    async fn revoke(&self, subscriber: &SubscriberId, session_id: &SessionId) -> Result<()>;
}

/// Reports traffic for a session as a cumulative byte counter
#[async_trait]
pub trait UsageMeter: Send + Sync {
    async fn bytes_transferred(
        &self,
        subscriber: &SubscriberId,
        session_id: &SessionId,
    ) -> Result<u64>;
}

/// Meter for time-only accounting
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMeter;

#[async_trait]
impl UsageMeter for NullMeter {
    async fn bytes_transferred(&self, _: &SubscriberId, _: &SessionId) -> Result<u64> {
        Ok(0)
    }
}
