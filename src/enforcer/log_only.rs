use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use super::AccessEnforcer;
use crate::ids::{SessionId, SubscriberId};

/// Enforcer that confirms every instruction without contacting a controller.
///
/// Used for dry runs and deployments where access is enforced elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyEnforcer;

#[async_trait]
impl AccessEnforcer for LogOnlyEnforcer {
    async fn grant(&self, subscriber: &SubscriberId, session_id: &SessionId) -> Result<()> {
        info!("[dry-run] Would grant access to {} (session {})", subscriber, session_id);
        Ok(())
    }

    async fn revoke(&self, subscriber: &SubscriberId, session_id: &SessionId) -> Result<()> {
        info!("[dry-run] Would revoke access for {} (session {})", subscriber, session_id);
        Ok(())
    }
}
