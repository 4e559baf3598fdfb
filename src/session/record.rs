use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{SessionId, SubscriberId};
use crate::quota::Usage;

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session in progress
    Idle,
    /// Waiting for the access enforcer to confirm the grant
    Starting,
    /// Access granted, usage accruing
    Active,
    /// Waiting for the access enforcer to confirm revocation
    Stopping,
    /// Terminal; usage and reason are frozen
    Ended,
}

impl SessionState {
    /// Starting, Active or Stopping
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Active | SessionState::Stopping
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserStopped,
    DataExhausted,
    TimeExhausted,
    AdminRevoked,
    /// The access enforcer could not confirm a grant or revocation
    EnforcementFailure,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndReason::UserStopped => "user_stopped",
            EndReason::DataExhausted => "data_exhausted",
            EndReason::TimeExhausted => "time_exhausted",
            EndReason::AdminRevoked => "admin_revoked",
            EndReason::EnforcementFailure => "enforcement_failure",
        };
        f.write_str(name)
    }
}

/// Persisted session record, owned by the session manager
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub subscriber: SubscriberId,
    pub state: SessionState,

    /// When the start was requested
    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,

    /// Usage has been charged up to this instant
    pub last_accrual: DateTime<Utc>,

    pub usage: Usage,

    /// Last cumulative reading from the usage meter
    #[serde(default)]
    pub metered_bytes: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,

    /// Reason replaced by an enforcement failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_reason: Option<EndReason>,

    /// Stop requested while Starting, applied on activation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_stop: Option<EndReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub(crate) fn starting(subscriber: SubscriberId, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            subscriber,
            state: SessionState::Starting,
            started_at: now,
            activated_at: None,
            last_accrual: now,
            usage: Usage::default(),
            metered_bytes: 0,
            end_reason: None,
            superseded_reason: None,
            pending_stop: None,
            failure: None,
            ended_at: None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            subscriber: self.subscriber.clone(),
            state: self.state,
            started_at: self.started_at,
            activated_at: self.activated_at,
            ended_at: self.ended_at,
            usage: self.usage,
            end_reason: self.end_reason,
            superseded_reason: self.superseded_reason,
            failure: self.failure.clone(),
        }
    }
}

/// Read-only view of a session for the presentation layer
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub subscriber: SubscriberId,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_reason: Option<EndReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}
