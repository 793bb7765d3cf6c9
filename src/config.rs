use anyhow::{bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::RepoRegistry;

/// Main configuration structure for headwatch
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Root directory holding one mirror per repository (`<repo_root>/<repo>`)
    #[serde(default = "default_repo_root")]
    pub repo_root: String,

    /// Directory where the webhook receiver touches one hint file per head
    #[serde(default = "default_hint_dir")]
    pub hint_dir: String,

    /// Private directory holding the last processed revision of each head
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Git executable
    #[serde(default = "default_git_binary")]
    pub git_binary: String,

    /// Hint polling interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String, // "1s"

    /// Retry policy for the pull step
    #[serde(default)]
    pub retry: RetryConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Downstream notification
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Event log
    #[serde(default)]
    pub events: EventsConfig,

    /// Tracked repositories and their branches
    #[serde(default)]
    pub repos: RepoRegistry,
}

/// Retry configuration for transient sync failures
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    /// Pause between attempts
    #[serde(default = "default_retry_interval")]
    pub interval: String, // "60s"

    /// Total attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location (background mode)
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Working directory after detaching
    #[serde(default = "default_working_directory")]
    pub working_directory: String,

    /// Account to run as after detaching
    pub user: Option<String>,

    /// Group to run as after detaching (defaults to the user's group)
    pub group: Option<String>,

    /// File creation mask after detaching
    #[serde(default = "default_umask")]
    pub umask: u32,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "full"
}

/// Downstream handler configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct NotifyConfig {
    /// Command to run per new revision; repo, branch and revision are appended
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// Event log configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EventsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// SQLite database path
    #[serde(default = "default_events_database")]
    pub database: String,

    /// Days of history kept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_repo_root() -> String {
    "/var/local/git".to_string()
}
fn default_hint_dir() -> String {
    "${HOME}/hints".to_string()
}
fn default_state_dir() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/headwatch/state", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/headwatch/state", home)
    } else {
        "/tmp/headwatch/state".to_string()
    }
}
fn default_git_binary() -> String {
    "git".to_string()
}
fn default_poll_interval() -> String {
    "1s".to_string()
}
fn default_retry_interval() -> String {
    "60s".to_string()
}
fn default_max_attempts() -> u32 {
    1000
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/headwatch.pid", runtime_dir)
    } else {
        "/tmp/headwatch.pid".to_string()
    }
}
fn default_log_file() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/headwatch/daemon.log", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/headwatch/daemon.log", home)
    } else {
        "/tmp/headwatch-daemon.log".to_string()
    }
}
fn default_working_directory() -> String {
    "/".to_string()
}
fn default_umask() -> u32 {
    0o002
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}
fn default_events_database() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/headwatch/events.db", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/headwatch/events.db", home)
    } else {
        "/tmp/headwatch/events.db".to_string()
    }
}
fn default_retention_days() -> u32 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: default_retry_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            working_directory: default_working_directory(),
            user: None,
            group: None,
            umask: default_umask(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            database: default_events_database(),
            retention_days: default_retention_days(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            bail!(
                "No configuration found at {:?}; create one or pass --config",
                config_path
            );
        }

        Self::load(&config_path)
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_yaml(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse, expand and validate configuration text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(content).context("Failed to parse configuration")?;

        // Expand environment variables in paths
        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("headwatch").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        let fields = [
            (&mut self.repo_root, "repo_root"),
            (&mut self.hint_dir, "hint_dir"),
            (&mut self.state_dir, "state_dir"),
            (&mut self.daemon.pid_file, "pid_file"),
            (&mut self.daemon.log_file, "log_file"),
            (&mut self.daemon.working_directory, "working_directory"),
            (&mut self.events.database, "events.database"),
        ];

        for (value, name) in fields {
            *value = shellexpand::full(value.as_str())
                .with_context(|| format!("Failed to expand {} path", name))?
                .into_owned();
        }

        Ok(())
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval()?.is_zero() {
            bail!("poll_interval must be at least 1s");
        }
        self.retry_interval()?;

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }

        if let Some(command) = &self.notify.command {
            if command.is_empty() {
                bail!("notify.command must name a program");
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval)
            .map(Duration::from_secs)
            .context("Failed to parse poll_interval")
    }

    pub fn retry_interval(&self) -> Result<Duration> {
        parse_duration(&self.retry.interval)
            .map(Duration::from_secs)
            .context("Failed to parse retry.interval")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo_root: default_repo_root(),
            hint_dir: default_hint_dir(),
            state_dir: default_state_dir(),
            git_binary: default_git_binary(),
            poll_interval: default_poll_interval(),
            retry: RetryConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
            notify: NotifyConfig::default(),
            events: EventsConfig::default(),
            repos: RepoRegistry::default(),
        }
    }
}

/// Parse duration strings like "30s", "1m", "2h" into seconds
pub fn parse_duration(duration_str: &str) -> Result<u64> {
    let duration_str = duration_str.trim().to_lowercase();

    let (value, unit, factor) = if let Some(value) = duration_str.strip_suffix('s') {
        (value, "seconds", 1)
    } else if let Some(value) = duration_str.strip_suffix('m') {
        (value, "minutes", 60)
    } else if let Some(value) = duration_str.strip_suffix('h') {
        (value, "hours", 3600)
    } else if let Some(value) = duration_str.strip_suffix('d') {
        (value, "days", 86400)
    } else {
        // Try to parse as raw seconds
        return duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '1s', '60s', '30m'");
    };

    value
        .parse::<u64>()
        .with_context(|| format!("Invalid {} value", unit))?
        .checked_mul(factor)
        .with_context(|| format!("Duration '{}' is too large", duration_str))
}
