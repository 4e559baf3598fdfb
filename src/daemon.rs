use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::catalog::PlanCatalog;
use crate::config::EngineConfig;
use crate::control::{ControlSpool, POLL_INTERVAL, process_pending};
use crate::enforcer::HttpEnforcer;
use crate::engine::Engine;
use crate::events::EngineEvent;
use crate::storage::fs::ensure_directory_exists;

/// Marks a state directory as owned by a running daemon
pub const LOCK_FILE: &str = "engine.lock";

/// Exclusive claim on a state directory, released on drop
#[derive(Debug)]
pub struct DaemonLock {
    path: PathBuf,
}

impl DaemonLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        ensure_directory_exists(state_dir)?;
        let path = state_dir.join(LOCK_FILE);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                anyhow::bail!(
                    "Another engine daemon appears to be running (lock file: {}). \
                     Remove the file if no daemon is running.",
                    path.display()
                );
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create lock file: {}", path.display()));
            }
        };

        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("Failed to write lock file: {}", path.display()))?;

        Ok(Self { path })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// True while a daemon holds the state directory
pub fn daemon_running(state_dir: &Path) -> bool {
    state_dir.join(LOCK_FILE).exists()
}

/// Build the engine for a daemon from its configuration
pub fn build_engine(config: &EngineConfig, catalog: PlanCatalog, state_dir: &Path) -> Result<Engine> {
    let builder = Engine::builder(catalog)
        .state_dir(state_dir)
        .session_config(config.session_config());

    let builder = match &config.enforcer.endpoint {
        Some(endpoint) => {
            tracing::info!("Access controller: {}", endpoint);
            let http = Arc::new(HttpEnforcer::new(&config.enforcer)?);
            builder.enforcer(http.clone()).meter(http)
        }
        None => {
            tracing::warn!("No enforcer endpoint configured; access changes will only be logged");
            builder
        }
    };

    builder.build()
}

/// Run the engine until Ctrl-C
pub async fn run_engine_daemon(
    config: EngineConfig,
    catalog: PlanCatalog,
    state_dir: PathBuf,
) -> Result<()> {
    tracing::info!("Starting hotspot engine");
    tracing::info!("Plans loaded: {}", catalog.len());
    tracing::info!(
        "Accrual interval: {} seconds",
        config.engine.accrual_interval
    );

    let _lock = DaemonLock::acquire(&state_dir)?;
    let engine = Arc::new(build_engine(&config, catalog, &state_dir)?);

    let spool = ControlSpool::open(&state_dir)?;
    let stale = spool.purge()?;
    if stale > 0 {
        tracing::warn!("Discarded {} control files from an earlier run", stale);
    }

    let report = engine
        .recover()
        .await
        .context("Failed to recover sessions")?;
    tracing::info!(
        "Recovered {} active, {} starting and {} stopping sessions",
        report.resumed,
        report.starting,
        report.stopping
    );
    if report.superseded > 0 {
        tracing::warn!(
            "Closed {} sessions superseded by a newer session of the same subscriber",
            report.superseded
        );
    }

    let events = engine.subscribe();
    let logger = tokio::spawn(log_events(events));
    let control = tokio::spawn(serve_control(engine.clone(), spool));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown requested; sessions will resume on next start");
    control.abort();
    engine.shutdown().await;
    logger.abort();

    Ok(())
}

/// Answer command-line requests until the task is aborted
async fn serve_control(engine: Arc<Engine>, spool: ControlSpool) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = process_pending(&engine, &spool) {
            tracing::warn!("Failed to read control requests: {:#}", e);
        }
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(EngineEvent::SessionChanged(snapshot)) => {
                tracing::debug!(
                    "Session {} ({}) is {}: {} bytes, {}s used",
                    snapshot.id,
                    snapshot.subscriber,
                    snapshot.state,
                    snapshot.usage.data_bytes,
                    snapshot.usage.time_seconds
                );
            }
            Ok(EngineEvent::BalanceChanged(balance)) => {
                tracing::debug!(
                    "Balance of {}: data {}, time {}",
                    balance.subscriber,
                    balance.data.display_bytes(),
                    balance.time.display_duration()
                );
            }
            Ok(EngineEvent::VoucherRedeemed { .. }) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!("Event log fell behind; {} events skipped", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
