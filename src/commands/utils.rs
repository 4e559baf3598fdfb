use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use hotspot_engine::catalog::{PlanCatalog, load_catalog};
use hotspot_engine::config::{EngineConfig, get_config_path};
use hotspot_engine::control::{ControlCommand, ControlReply, ControlSpool};
use hotspot_engine::daemon::daemon_running;
use hotspot_engine::engine::Engine;

/// Initialize logging
///
/// `RUST_LOG` overrides; otherwise `--verbose` selects debug and the
/// configured level applies. Logs go to stderr so command output stays clean.
pub fn init_logging(verbose: bool, configured: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { configured };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

/// Settings shared by every command
pub struct CommandContext {
    pub config_path: PathBuf,
    pub config: EngineConfig,
    pub json: bool,
}

impl CommandContext {
    pub fn load(config_path: Option<PathBuf>, json: bool) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => get_config_path()?,
        };
        let config = EngineConfig::load_or_default(&config_path)?;

        Ok(Self {
            config_path,
            config,
            json,
        })
    }

    pub fn catalog(&self) -> Result<PlanCatalog> {
        let path = self.config.catalog_path(&self.config_path);
        load_catalog(&path).context("Failed to load plan catalog. Run 'hotspot-engine init' first.")
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        self.config.state_dir()
    }

    /// Engine over the persisted state, for reading
    pub fn open_engine(&self) -> Result<Engine> {
        Engine::open(self.catalog()?, &self.state_dir()?)
    }

    /// Engine over the persisted state, refusing while a daemon owns it
    pub fn open_engine_for_update(&self) -> Result<Engine> {
        let state_dir = self.state_dir()?;
        if daemon_running(&state_dir) {
            anyhow::bail!(
                "The engine daemon is running on {}. Stop it before changing state from the command line.",
                state_dir.display()
            );
        }

        Engine::open(self.catalog()?, &state_dir)
    }
}

/// Slack on top of the engine's own timeouts when waiting for the daemon
pub const REPLY_MARGIN: Duration = Duration::from_secs(30);

/// How a report is printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Json,
    Csv,
}

impl CommandContext {
    pub fn report_format(&self, csv: bool) -> Result<ReportFormat> {
        match (self.json, csv) {
            (true, true) => anyhow::bail!("--json and --csv cannot be combined"),
            (true, false) => Ok(ReportFormat::Json),
            (false, true) => Ok(ReportFormat::Csv),
            (false, false) => Ok(ReportFormat::Text),
        }
    }

    /// Control spool of the running daemon, if there is one
    pub fn daemon_spool(&self) -> Result<Option<ControlSpool>> {
        let state_dir = self.state_dir()?;
        if !daemon_running(&state_dir) {
            return Ok(None);
        }
        Ok(Some(ControlSpool::open(&state_dir)?))
    }

    /// Have the daemon run `command`; a failed request becomes an error
    pub fn ask_daemon(
        &self,
        spool: &ControlSpool,
        command: ControlCommand,
        limit: Duration,
    ) -> Result<ControlReply> {
        let id = spool.submit(command)?;
        match runtime()?.block_on(spool.wait_reply(id, limit))? {
            ControlReply::Failed { message, .. } => anyhow::bail!("{}", message),
            reply => Ok(reply),
        }
    }
}

/// Runtime for commands that talk to the engine
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to start async runtime")
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

pub fn print_csv<T: Serialize>(rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    for row in rows {
        writer.serialize(row).context("Failed to write CSV row")?;
    }
    writer.flush().context("Failed to write CSV output")?;
    Ok(())
}

/// Format a timestamp for display
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S %Z").to_string()
}

/// Format an amount in minor currency units
pub fn format_price(cents: u64) -> String {
    format!("{}.{:02}", cents / 100, cents % 100)
}
