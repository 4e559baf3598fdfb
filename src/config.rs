use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::{RetryPolicy, SessionConfig};
use crate::storage::fs::write_private;

/// Engine daemon configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub enforcer: EnforcerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session timing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSettings {
    /// Seconds between accrual ticks of an active session
    #[serde(default = "default_accrual_interval")]
    pub accrual_interval: u64,

    /// Seconds a session may wait for its access grant
    #[serde(default = "default_handshake_timeout")]
    pub starting_timeout: u64,

    /// Seconds a session may wait for its access revocation
    #[serde(default = "default_handshake_timeout")]
    pub stopping_timeout: u64,
}

/// Network-access controller settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnforcerConfig {
    /// Controller REST endpoint; without one, access instructions are only logged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bearer token for the controller (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Per-request timeout (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Delay before the first retry of a failed grant or revoke
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Where engine state lives
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory for voucher, balance and session records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Plan catalog (YAML)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_accrual_interval() -> u64 {
    60 // 1 minute
}

fn default_handshake_timeout() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

fn default_retry_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Upper bound for `max_retries`; backoff doubles per retry
const MAX_RETRY_CEILING: u32 = 10;

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            accrual_interval: default_accrual_interval(),
            starting_timeout: default_handshake_timeout(),
            stopping_timeout: default_handshake_timeout(),
        }
    }
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            access_token: None,
            request_timeout: default_request_timeout(),
            retry_interval_ms: default_retry_interval_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load the config file if it exists, otherwise use defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // May contain the controller token
        write_private(path, toml.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.accrual_interval == 0 {
            anyhow::bail!("Accrual interval must be at least 1 second");
        }

        if self.engine.starting_timeout == 0 || self.engine.stopping_timeout == 0 {
            anyhow::bail!("Starting and stopping timeouts must be at least 1 second");
        }

        if let Some(endpoint) = &self.enforcer.endpoint {
            let url = url::Url::parse(endpoint).context("Invalid enforcer endpoint")?;

            // Ensure HTTPS only
            if url.scheme() != "https" {
                anyhow::bail!("Enforcer endpoint must use HTTPS (got: {})", url.scheme());
            }
        }

        if self.enforcer.request_timeout == 0 {
            anyhow::bail!("Enforcer request timeout must be at least 1 second");
        }

        if self.enforcer.retry_interval_ms == 0 {
            anyhow::bail!("Enforcer retry interval must be greater than zero");
        }

        if self.enforcer.max_retries > MAX_RETRY_CEILING {
            anyhow::bail!(
                "Enforcer max_retries must be at most {} (got: {})",
                MAX_RETRY_CEILING,
                self.enforcer.max_retries
            );
        }

        if self.logging.level.trim().is_empty() {
            anyhow::bail!("Log level cannot be empty");
        }

        Ok(())
    }

    /// Session timing derived from this configuration
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            accrual_interval: Duration::from_secs(self.engine.accrual_interval),
            starting_timeout: Duration::from_secs(self.engine.starting_timeout),
            stopping_timeout: Duration::from_secs(self.engine.stopping_timeout),
            retry: RetryPolicy {
                retry_interval: Duration::from_millis(self.enforcer.retry_interval_ms),
                max_retries: self.enforcer.max_retries,
            },
        }
    }

    /// Configured state directory, or the platform default
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.storage.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_state_dir(),
        }
    }

    /// Configured catalog path, or `plans.yaml` next to the config file
    pub fn catalog_path(&self, config_path: &Path) -> PathBuf {
        match &self.storage.catalog {
            Some(path) => path.clone(),
            None => config_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("plans.yaml"),
        }
    }
}

/// Get the platform-specific engine config file path
pub fn get_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/hotspot-engine/engine.conf"))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from("/Library/Application Support/hotspot-engine/engine.conf"))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("hotspot-engine");
        path.push("engine.conf");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        user_project_dirs().map(|dirs| dirs.config_dir().join("engine.conf"))
    }
}

/// Get the platform-specific state directory
pub fn default_state_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        // Try system location first, fall back to user location
        let system_dir = PathBuf::from("/var/lib/hotspot-engine");
        if system_dir.exists() || system_dir.parent().map(is_writable).unwrap_or(false) {
            return Ok(system_dir);
        }

        user_project_dirs().map(|dirs| dirs.data_local_dir().to_path_buf())
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from("/Library/Application Support/hotspot-engine/state"))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("hotspot-engine");
        path.push("state");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        user_project_dirs().map(|dirs| dirs.data_local_dir().to_path_buf())
    }
}

#[cfg(target_os = "linux")]
fn is_writable(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn user_project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "hotspot-engine")
        .context("Could not determine user data directory")
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../example-engine.conf");
