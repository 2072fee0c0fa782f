//! Configuration management for gwatch
//!
//! Handles loading and validation of gw.toml configuration files, plus the
//! `GW_*` environment overrides the capsule and scheduler honour.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming a config file for [`Config::load`].
pub const ENV_CONFIG: &str = "GW_CONFIG";
/// Scheduler IPv4 address the capsule connects to.
pub const ENV_SCHEDULER_IPV4: &str = "GW_SCHEDULER_IPV4";
/// Scheduler port, used by both sides.
pub const ENV_SCHEDULER_PORT: &str = "GW_SCHEDULER_SERVE_WS_PORT";
/// Root directory for per-capsule log files.
pub const ENV_LOG_PATH: &str = "GW_LOG_PATH";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub capsule: CapsuleConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Root directory for per-capsule log files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "/var/gwatch".to_string()
}

/// Scheduler (broker) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite file for the SQL store; in-memory when unset
    #[serde(default)]
    pub sql_db_path: Option<PathBuf>,

    /// Inbound messages queued per connection before the reader waits
    #[serde(default = "default_handler_queue_depth")]
    pub handler_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
            sql_db_path: None,
            handler_queue_depth: default_handler_queue_depth(),
        }
    }
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10322
}

fn default_handler_queue_depth() -> usize {
    1024
}

/// Capsule (in-process agent) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapsuleConfig {
    #[serde(default = "default_scheduler_ip")]
    pub scheduler_ip: String,

    #[serde(default = "default_port")]
    pub scheduler_port: u16,

    /// Capacity of each per-thread event queue
    #[serde(default = "default_trace_queue_capacity")]
    pub trace_queue_capacity: usize,

    /// Report loop sleep when there is nothing to drain
    #[serde(default = "default_report_idle_backoff_us")]
    pub report_idle_backoff_us: u64,

    /// How long a stopping report loop keeps draining queued events
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// 0 disables heartbeats
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Stop-flag poll interval while waiting for the outbound queue to drain
    #[serde(default = "default_sync_send_poll_ms")]
    pub sync_send_poll_ms: u64,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            scheduler_ip: default_scheduler_ip(),
            scheduler_port: default_port(),
            trace_queue_capacity: default_trace_queue_capacity(),
            report_idle_backoff_us: default_report_idle_backoff_us(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            sync_send_poll_ms: default_sync_send_poll_ms(),
        }
    }
}

fn default_scheduler_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_trace_queue_capacity() -> usize {
    8192
}

fn default_report_idle_backoff_us() -> u64 {
    200
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_sync_send_poll_ms() -> u64 {
    50
}

/// Chunked transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    gwatch_codec::frame::CHUNK_SIZE
}

fn default_max_message_size() -> usize {
    gwatch_codec::frame::MAX_MESSAGE_SIZE
}

impl Config {
    /// `$GW_CONFIG` when set, otherwise defaults, with environment
    /// overrides applied and validated.
    pub fn load() -> crate::Result<Self> {
        let mut config = match std::env::var_os(ENV_CONFIG) {
            Some(path) => Self::load_from(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Environment overrides are not applied.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let display = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(display).into());
            }
            Err(err) => return Err(ConfigError::ReadFailed(display, err.to_string()).into()),
        };
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| ConfigError::ParseFailed(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| ConfigError::SerializeFailed(err.to_string()).into())
    }

    /// Apply `GW_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> crate::Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `GW_*` overrides from an arbitrary lookup; used by tests.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ip) = lookup(ENV_SCHEDULER_IPV4) {
            if ip.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(ConfigError::InvalidEnv {
                    name: ENV_SCHEDULER_IPV4.to_string(),
                    value: ip,
                }
                .into());
            }
            self.capsule.scheduler_ip = ip;
        }
        if let Some(port) = lookup(ENV_SCHEDULER_PORT) {
            let parsed = port.parse::<u16>().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_SCHEDULER_PORT.to_string(),
                value: port.clone(),
            })?;
            self.scheduler.port = parsed;
            self.capsule.scheduler_port = parsed;
        }
        if let Some(dir) = lookup(ENV_LOG_PATH) {
            self.general.log_dir = dir;
        }
        Ok(())
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: &str| -> crate::Result<()> {
            Err(ConfigError::ValidationError(msg.to_string()).into())
        };
        if self.transport.chunk_size == 0 {
            return invalid("transport.chunk_size must be greater than 0");
        }
        if self.transport.chunk_size > self.transport.max_message_size {
            return invalid("transport.chunk_size must not exceed transport.max_message_size");
        }
        if self.capsule.trace_queue_capacity == 0 {
            return invalid("capsule.trace_queue_capacity must be greater than 0");
        }
        if self.scheduler.handler_queue_depth == 0 {
            return invalid("scheduler.handler_queue_depth must be greater than 0");
        }
        if self.general.log_level.parse::<crate::logging::LogLevel>().is_err() {
            return invalid("general.log_level must be one of trace, debug, info, warn, error");
        }
        Ok(())
    }

    /// Scheduler address the capsule dials.
    #[must_use]
    pub fn scheduler_addr(&self) -> String {
        format!("{}:{}", self.capsule.scheduler_ip, self.capsule.scheduler_port)
    }

    /// Address the scheduler binds.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.scheduler.bind_ip, self.scheduler.port)
    }
}
