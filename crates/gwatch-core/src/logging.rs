//! Process-wide `tracing` setup.
//!
//! The scheduler and capsules log to stderr, either human-readable or as one
//! JSON object per line. A capsule may additionally append to
//! `<log_dir>/<global_id>/main.log`. `RUST_LOG` wins over the configured
//! level when set.
//!
//! Field names used across the crate: `conn_id`, `role`, `type_id`,
//! `ref_id`, `uri`, `trace`, `event_id`, `capsule`.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type SinkLayer = Box<dyn Layer<Registry> + Send + Sync>;

static INSTALLED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub format: LogFormat,
    /// Mirror every record into this file as well as stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

impl LogConfig {
    #[must_use]
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            level: config.general.log_level.clone(),
            format: config.general.log_format,
            file: None,
        }
    }

    /// Same settings, also writing to the capsule's own log file.
    #[must_use]
    pub fn for_capsule(config: &crate::config::Config, capsule_global_id: &str) -> Self {
        Self {
            file: Some(capsule_log_path(&config.general.log_dir, capsule_global_id)),
            ..Self::from_config(config)
        }
    }
}

/// `<log_dir>/<capsule_global_id>/main.log`
#[must_use]
pub fn capsule_log_path(log_dir: &str, capsule_global_id: &str) -> PathBuf {
    Path::new(log_dir).join(capsule_global_id).join("main.log")
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("cannot open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("cannot install subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Opens `path` for appending. Directories and the file are created owner-only
/// (0700 / 0600); existing ones keep their permissions.
fn open_append(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            restrict(dir, 0o700)?;
        }
    }
    let fresh = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    if fresh {
        restrict(path, 0o600)?;
    }
    Ok(file)
}

fn sink_layer<W>(format: LogFormat, writer: W, ansi: bool) -> SinkLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer().with_writer(writer).with_target(true);
    match format {
        LogFormat::Pretty => base.with_ansi(ansi).boxed(),
        LogFormat::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

/// Installs the global subscriber. Only the first successful call takes
/// effect; later ones return [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if INSTALLED.load(Ordering::Acquire) {
        return Err(LogError::AlreadyInitialized);
    }
    if config.level.parse::<LogLevel>().is_err() {
        return Err(LogError::InvalidLevel(config.level.clone()));
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut sinks = vec![sink_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = Arc::new(open_append(path)?);
        sinks.push(sink_layer(config.format, file, false));
    }

    tracing::subscriber::set_global_default(Registry::default().with(sinks).with(filter))?;
    INSTALLED.store(true, Ordering::Release);

    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging ready"
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let level = match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("{raw:?} is not a log level")),
        };
        Ok(level)
    }
}
