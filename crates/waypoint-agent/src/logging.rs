//! Logging setup for the agent.
//!
//! Console output goes to stderr so that `list`/`watch` output on stdout can
//! be piped. File logging is off by default and writes a single rolling
//! `waypoint-agent.log`.
//!
//! | Variable               | Meaning                         | Default            |
//! |------------------------|---------------------------------|--------------------|
//! | `WAYPOINT_LOG_DIR`     | directory of the log file       | `~/waypoint/logs`  |
//! | `WAYPOINT_LOG_CONSOLE` | console output                  | `true`             |
//! | `WAYPOINT_LOG_FILE`    | file output                     | `false`            |
//! | `WAYPOINT_LOG_LEVEL`   | level of both outputs           | `info`             |
//! | `WAYPOINT_LOG_ROTATION`| `daily`, `hourly` or `never`    | `daily`            |
//!
//! `RUST_LOG`, when set, takes precedence over `WAYPOINT_LOG_LEVEL`.

use std::path::PathBuf;

use anyhow::anyhow;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

const LOG_FILE_NAME: &str = "waypoint-agent.log";

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Daily,
    Hourly,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

impl std::str::FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(LogRotation::Daily),
            "hourly" => Ok(LogRotation::Hourly),
            "never" => Ok(LogRotation::Never),
            other => Err(format!("unknown log rotation '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub file_logging: bool,
    pub level: Level,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(None),
            console_output: true,
            file_logging: false,
            level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

fn default_log_dir(home: Option<String>) -> PathBuf {
    let home = home.unwrap_or_else(|| "/tmp".to_string());
    PathBuf::from(format!("{}/waypoint/logs", home))
}

fn flag(value: Option<String>, default: bool) -> bool {
    match value {
        Some(v) => {
            let v = v.to_lowercase();
            if default {
                v != "false" && v != "0"
            } else {
                v == "true" || v == "1"
            }
        }
        None => default,
    }
}

impl LoggingConfig {
    /// Create from `WAYPOINT_LOG_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_dir = lookup("WAYPOINT_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_log_dir(lookup("HOME")));

        Self {
            log_dir,
            console_output: flag(lookup("WAYPOINT_LOG_CONSOLE"), true),
            file_logging: flag(lookup("WAYPOINT_LOG_FILE"), false),
            level: lookup("WAYPOINT_LOG_LEVEL")
                .and_then(|v| v.parse().ok())
                .unwrap_or(Level::INFO),
            rotation: lookup("WAYPOINT_LOG_ROTATION")
                .and_then(|v| v.parse().ok())
                .unwrap_or(LogRotation::Daily),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Keeps the non-blocking file writer alive; dropping it flushes buffered
/// output.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    if config.console_output {
        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(config.filter());
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = RollingFileAppender::new(config.rotation.into(), &config.log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(config.filter());
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(log_dir = %config.log_dir.display(), "File logging initialized");
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
