//! Control channel between the command line and a running daemon.
//!
//! While the daemon owns the state directory, commands that need the live
//! session manager are written as JSON requests into
//! `<state_dir>/control/requests`. The daemon polls that directory, runs each
//! request against its engine and answers in `<state_dir>/control/replies`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balance::Balance;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::ids::{PlanId, SubscriberId};
use crate::session::SessionSnapshot;
use crate::storage::fs::{atomic_write, ensure_directory_exists};

pub const CONTROL_DIR: &str = "control";

/// How often the daemon and waiting commands look at the spool
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    StartSession { subscriber: SubscriberId },
    StopSession { subscriber: SubscriberId },
    RevokeSession { subscriber: SubscriberId },
    Redeem { code: String, subscriber: SubscriberId },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ControlRequest {
    pub id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub command: ControlCommand,
}

/// Outcome of a request, as written by the daemon
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlReply {
    Session {
        session: SessionSnapshot,
    },
    Redeemed {
        plan_id: PlanId,
        plan_name: String,
        balance: Balance,
    },
    Failed {
        category: String,
        message: String,
    },
}

impl ControlReply {
    pub fn failed(error: &EngineError) -> Self {
        ControlReply::Failed {
            category: error.category().to_string(),
            message: error.to_string(),
        }
    }
}

/// The request and reply directories of one state directory
#[derive(Debug, Clone)]
pub struct ControlSpool {
    requests: PathBuf,
    replies: PathBuf,
}

impl ControlSpool {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let root = state_dir.join(CONTROL_DIR);
        let spool = Self {
            requests: root.join("requests"),
            replies: root.join("replies"),
        };
        ensure_directory_exists(&spool.requests)?;
        ensure_directory_exists(&spool.replies)?;
        Ok(spool)
    }

    /// Queue a command for the daemon
    pub fn submit(&self, command: ControlCommand) -> Result<Uuid> {
        let request = ControlRequest {
            id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            command,
        };

        let json = serde_json::to_vec_pretty(&request).context("Failed to serialize request")?;
        atomic_write(&file_for(&self.requests, request.id), &json)?;
        debug!("Submitted control request {}", request.id);
        Ok(request.id)
    }

    /// Wait for the daemon's answer to request `id`.
    ///
    /// A request still queued when `limit` runs out is withdrawn.
    pub async fn wait_reply(&self, id: Uuid, limit: Duration) -> Result<ControlReply> {
        let path = file_for(&self.replies, id);
        let deadline = Instant::now() + limit;

        loop {
            if path.exists() {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read reply: {}", path.display()))?;
                let _ = std::fs::remove_file(&path);
                return serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse reply: {}", path.display()));
            }

            if Instant::now() >= deadline {
                let _ = std::fs::remove_file(file_for(&self.requests, id));
                anyhow::bail!(
                    "The engine daemon did not answer within {:?}. Check that it is running.",
                    limit
                );
            }

            sleep(POLL_INTERVAL).await;
        }
    }

    /// Queued requests, oldest first. Unreadable requests are discarded.
    pub fn pending(&self) -> Result<Vec<ControlRequest>> {
        let entries = std::fs::read_dir(&self.requests).with_context(|| {
            format!("Failed to read request directory: {}", self.requests.display())
        })?;

        let mut requests = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !is_spool_file(&path) {
                continue;
            }

            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| Ok(serde_json::from_str::<ControlRequest>(&content)?));
            match parsed {
                Ok(request) => requests.push(request),
                Err(e) => {
                    warn!("Discarding unreadable control request {}: {:#}", path.display(), e);
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        requests.sort_by_key(|r| r.submitted_at);
        Ok(requests)
    }

    /// Claim a queued request. False if its sender already withdrew it.
    pub fn take(&self, id: Uuid) -> Result<bool> {
        let path = file_for(&self.requests, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to claim request: {}", path.display()))
            }
        }
    }

    pub fn reply(&self, id: Uuid, reply: &ControlReply) -> Result<()> {
        let json = serde_json::to_vec_pretty(reply).context("Failed to serialize reply")?;
        atomic_write(&file_for(&self.replies, id), &json)
    }

    /// Drop requests and replies left by an earlier daemon
    pub fn purge(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in [&self.requests, &self.replies] {
            for entry in std::fs::read_dir(dir)
                .with_context(|| format!("Failed to read {}", dir.display()))?
            {
                let path = entry?.path();
                if path.is_file() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn file_for(dir: &Path, id: Uuid) -> PathBuf {
    dir.join(format!("{}.json", id))
}

fn is_spool_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with('.'));
    !hidden && path.extension().is_some_and(|ext| ext == "json")
}

/// Claim every queued request and run each on its own task
pub fn process_pending(engine: &Arc<Engine>, spool: &ControlSpool) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();

    for request in spool.pending()? {
        if !spool.take(request.id)? {
            continue;
        }

        let engine = engine.clone();
        let spool = spool.clone();
        handles.push(tokio::spawn(async move {
            let reply = execute(&engine, request.command).await;
            if let Err(e) = spool.reply(request.id, &reply) {
                warn!("Failed to answer control request {}: {:#}", request.id, e);
            }
        }));
    }

    Ok(handles)
}

/// Run one command against the engine
pub async fn execute(engine: &Engine, command: ControlCommand) -> ControlReply {
    info!("Control request: {:?}", command);

    let result = match command {
        ControlCommand::StartSession { subscriber } => engine
            .start_session_and_wait(&subscriber)
            .await
            .map(|session| ControlReply::Session { session }),
        ControlCommand::StopSession { subscriber } => engine
            .stop_session(&subscriber)
            .await
            .map(|session| ControlReply::Session { session }),
        ControlCommand::RevokeSession { subscriber } => engine
            .admin_revoke(&subscriber)
            .await
            .map(|session| ControlReply::Session { session }),
        ControlCommand::Redeem { code, subscriber } => {
            match engine.redeem_voucher(&code, &subscriber).await {
                Ok(plan) => Ok(ControlReply::Redeemed {
                    plan_id: plan.id.clone(),
                    plan_name: plan.name.clone(),
                    balance: engine.read_balance(&subscriber).await,
                }),
                Err(e) => Err(e),
            }
        }
    };

    result.unwrap_or_else(|e| {
        warn!("Control request failed: {}", e);
        ControlReply::failed(&e)
    })
}
