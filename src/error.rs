use thiserror::Error;

use crate::ids::{PlanId, SessionId, SubscriberId};

/// Result alias for engine entry points
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine operations.
///
/// Every variant maps to a stable [`EngineError::category`] so the
/// presentation layer can pick a message without parsing `Display` output.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Plan '{plan_id}' does not exist or is not available")]
    InvalidPlan { plan_id: PlanId },

    #[error("Cannot issue {requested} vouchers in one batch (allowed: 1 to {max})")]
    InvalidIssueCount { requested: usize, max: usize },

    #[error("Voucher '{code}' not found")]
    VoucherNotFound { code: String },

    #[error("Voucher '{code}' has already been redeemed")]
    VoucherAlreadyRedeemed { code: String },

    #[error("Voucher '{code}' has been revoked")]
    VoucherRevoked { code: String },

    #[error("Subscriber '{subscriber}' has insufficient balance to start a session")]
    InsufficientBalance { subscriber: SubscriberId },

    #[error("Subscriber '{subscriber}' already has a session in progress ({session_id})")]
    SessionAlreadyActive {
        subscriber: SubscriberId,
        session_id: SessionId,
    },

    #[error("Subscriber '{subscriber}' has no session in progress")]
    SessionNotFound { subscriber: SubscriberId },

    #[error("Access enforcement failed for session {session_id}: {detail}")]
    EnforcementFailure { session_id: SessionId, detail: String },

    #[error("Storage unavailable while {operation}")]
    StorageUnavailable {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EngineError {
    /// Stable, machine-readable category for this error
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::InvalidPlan { .. } => "invalid_plan",
            EngineError::InvalidIssueCount { .. } => "invalid_issue_count",
            EngineError::VoucherNotFound { .. } => "voucher_not_found",
            EngineError::VoucherAlreadyRedeemed { .. } => "voucher_already_redeemed",
            EngineError::VoucherRevoked { .. } => "voucher_revoked",
            EngineError::InsufficientBalance { .. } => "insufficient_balance",
            EngineError::SessionAlreadyActive { .. } => "session_already_active",
            EngineError::SessionNotFound { .. } => "session_not_found",
            EngineError::EnforcementFailure { .. } => "enforcement_failure",
            EngineError::StorageUnavailable { .. } => "storage_unavailable",
        }
    }

    pub(crate) fn storage(
        operation: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        EngineError::StorageUnavailable {
            operation: operation.into(),
            source: source.into(),
        }
    }
}
