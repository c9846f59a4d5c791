use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Directory name under the data root and /etc
pub const APP_NAME: &str = "computer-safety";

/// Setting this to "1" disables enforcement for the process lifetime
pub const BYPASS_ENV: &str = "COMPUTER_SAFETY_DISABLED";
pub const DAILY_LIMIT_ENV: &str = "COMPUTER_SAFETY_DAILY_LIMIT_SECONDS";
pub const TICK_INTERVAL_ENV: &str = "COMPUTER_SAFETY_TICK_INTERVAL_SECONDS";
pub const DATA_DIR_ENV: &str = "COMPUTER_SAFETY_DATA_DIR";

/// Upper bound on `enforcement.max_attempts`
pub const MAX_ENFORCEMENT_ATTEMPTS: u32 = 10;

/// Process-wide quota configuration, loaded once at startup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QuotaConfig {
    /// Allowed active seconds per user per local calendar day
    #[serde(default = "default_daily_limit")]
    pub daily_limit_seconds: u64,

    /// Seconds between accounting ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,

    /// Most usage a single tick may credit (defaults to two tick intervals).
    /// Longer gaps are treated as suspend, not use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tick_credit_seconds: Option<u64>,

    /// How long a flush may wait for the disk before giving up
    #[serde(default = "default_save_timeout")]
    pub save_timeout_seconds: u64,

    /// Where usage records and event logs live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Countdown notifications, minutes before the limit
    #[serde(default = "default_warnings")]
    pub warnings_minutes: Vec<u32>,

    #[serde(default)]
    pub enforcement: EnforcementConfig,
}

fn default_daily_limit() -> u64 {
    30 * 60
}

fn default_tick_interval() -> u64 {
    10
}

fn default_save_timeout() -> u64 {
    5
}

fn default_warnings() -> Vec<u32> {
    vec![5, 1]
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit_seconds: default_daily_limit(),
            tick_interval_seconds: default_tick_interval(),
            max_tick_credit_seconds: None,
            save_timeout_seconds: default_save_timeout(),
            data_dir: None,
            warnings_minutes: default_warnings(),
            enforcement: EnforcementConfig::default(),
        }
    }
}

impl QuotaConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }

    pub fn max_tick_credit_seconds(&self) -> u64 {
        self.max_tick_credit_seconds
            .unwrap_or(self.tick_interval_seconds.saturating_mul(2))
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_secs(self.save_timeout_seconds)
    }

    /// Apply overrides from the environment (or any key lookup)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(DAILY_LIMIT_ENV) {
            self.daily_limit_seconds = parse_env(DAILY_LIMIT_ENV, &value)?;
        }
        if let Some(value) = lookup(TICK_INTERVAL_ENV) {
            self.tick_interval_seconds = parse_env(TICK_INTERVAL_ENV, &value)?;
        }
        if let Some(value) = lookup(DATA_DIR_ENV) {
            if !value.is_empty() {
                self.data_dir = Some(PathBuf::from(value));
            }
        }
        Ok(())
    }

    /// Data directory, falling back to the per-user default
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }
}

fn parse_env(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}

/// How the logout is carried out
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnforcementConfig {
    /// Delay between the "time is up" notice and the logout
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,

    /// Bounded escalation through the logout mechanisms
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Show desktop notifications
    #[serde(default = "default_true")]
    pub notify: bool,
}

fn default_grace_period() -> u64 {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: default_grace_period(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            notify: true,
        }
    }
}

/// Troubleshooting escape hatch, read once at process start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BypassSwitch {
    enabled: bool,
}

impl BypassSwitch {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = lookup(BYPASS_ENV)
            .map(|v| matches!(v.trim(), "1" | "true"))
            .unwrap_or(false);
        Self { enabled }
    }

    #[cfg(test)]
    pub fn enabled() -> Self {
        Self { enabled: true }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// System-wide config file location
pub fn get_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push(APP_NAME);
        path.push("config.yaml");
        path
    }

    #[cfg(target_os = "macos")]
    {
        PathBuf::from(format!("/Library/Application Support/{}/config.yaml", APP_NAME))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        PathBuf::from(format!("/etc/{}/config.yaml", APP_NAME))
    }
}

/// `$XDG_DATA_HOME/computer-safety`, else the platform data dir
pub fn default_data_dir() -> Result<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(xdg).join(APP_NAME));
    }

    directories::ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .context("Could not determine data directory")
}

/// Load configuration from a YAML file
pub fn load_config(path: &Path) -> Result<QuotaConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: QuotaConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load the effective configuration: file (if any), then environment overrides
///
/// An explicit path must exist. The default path is optional and a missing file
/// means built-in defaults.
pub fn load_effective(explicit: Option<&Path>) -> Result<QuotaConfig> {
    let mut config = match explicit {
        Some(path) => load_config(path)?,
        None => {
            let path = get_config_path();
            if path.exists() {
                load_config(&path)?
            } else {
                tracing::debug!("No config at {}, using defaults", path.display());
                QuotaConfig::default()
            }
        }
    };

    config
        .apply_env_overrides(|key| std::env::var(key).ok())
        .context("Invalid environment override")?;
    validate_config(&config)?;

    Ok(config)
}

/// Validate configuration
pub fn validate_config(config: &QuotaConfig) -> Result<(), ConfigError> {
    if config.daily_limit_seconds == 0 {
        return Err(ConfigError::NotPositive("daily_limit_seconds"));
    }
    if config.tick_interval_seconds == 0 {
        return Err(ConfigError::NotPositive("tick_interval_seconds"));
    }
    if config.save_timeout_seconds == 0 {
        return Err(ConfigError::NotPositive("save_timeout_seconds"));
    }
    if config.enforcement.max_attempts == 0 {
        return Err(ConfigError::NotPositive("enforcement.max_attempts"));
    }
    if config.enforcement.max_attempts > MAX_ENFORCEMENT_ATTEMPTS {
        return Err(ConfigError::TooLarge {
            name: "enforcement.max_attempts",
            value: u64::from(config.enforcement.max_attempts),
            max: u64::from(MAX_ENFORCEMENT_ATTEMPTS),
        });
    }

    let credit = config.max_tick_credit_seconds();
    if credit < config.tick_interval_seconds {
        return Err(ConfigError::CreditBelowTick {
            credit,
            tick: config.tick_interval_seconds,
        });
    }

    if config.warnings_minutes.windows(2).any(|w| w[1] >= w[0]) {
        return Err(ConfigError::WarningsOrder(config.warnings_minutes.clone()));
    }

    Ok(())
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");
