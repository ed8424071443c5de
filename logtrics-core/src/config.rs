//! Application configuration loaded from TOML and CLI flags.
//!
//! The configuration is created once at startup and stays immutable.
//! Rule files may overlay a narrow subset of it (`graphite`, `logging`,
//! `expression`); the overlay produces a fresh copy, see
//! [`crate::script::logtric`].

use std::{fmt, path::Path, path::PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LogtricsError;

/// Reader mode selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Console,
    Udp,
    Tcp,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Console => write!(f, "console"),
            Mode::Udp => write!(f, "udp"),
            Mode::Tcp => write!(f, "tcp"),
        }
    }
}

/// Logging sink selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    #[default]
    Console,
    Syslog,
}

impl fmt::Display for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSink::Console => write!(f, "console"),
            LogSink::Syslog => write!(f, "syslog"),
        }
    }
}

impl std::str::FromStr for LogSink {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "console" => Ok(LogSink::Console),
            "syslog" => Ok(LogSink::Syslog),
            other => Err(format!("invalid logging type [{other}]")),
        }
    }
}

/// Logging verbosity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("invalid logging level [{other}]")),
        }
    }
}

impl LogLevel {
    /// Maps the configured level onto a tracing level for filter directives.
    pub fn as_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Logging destination and level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    #[serde(rename = "type")]
    pub sink: LogSink,
    pub level: LogLevel,
}

/// Console reader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Readline history file; the only state the process persists.
    pub history: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            history: Some(PathBuf::from("/tmp/logtrics_history")),
        }
    }
}

/// UDP reader bind endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4002,
        }
    }
}

/// TCP reader bind endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4003,
        }
    }
}

/// Graphite sink endpoint and flush cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphiteConfig {
    pub host: String,
    pub port: u16,
    /// Flush interval in seconds.
    pub interval: u64,
    /// When enabled every flushed batch is also written to the process log.
    pub debug: bool,
}

impl Default for GraphiteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 2024,
            interval: 30,
            debug: false,
        }
    }
}

/// Main configuration struct for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Enabled reader modes; at least one is required to start.
    pub modes: Vec<Mode>,
    /// Per-script event queue capacity in async mode.
    #[serde(rename = "buffersize")]
    pub buffer_size: usize,
    /// Rule file; wins over `scriptdir` when both are set.
    #[serde(rename = "scriptfile")]
    pub script_file: Option<PathBuf>,
    /// Directory walked for `*.lua` rule files.
    #[serde(rename = "scriptdir")]
    pub script_dir: Option<PathBuf>,
    /// Default parser expression, overridable per logtric declaration.
    pub expression: Option<String>,
    pub console: ConsoleConfig,
    pub logging: Logging,
    pub udp: UdpConfig,
    pub tcp: TcpConfig,
    pub graphite: GraphiteConfig,
}

impl Configuration {
    /// Loads the configuration from a TOML file, or returns defaults when
    /// the file does not exist.
    pub async fn load(path: &Path) -> Result<Self, LogtricsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        info!("loading config from {}", path.display());
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| LogtricsError::ConfigIo {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = Configuration::default();
        assert!(conf.modes.is_empty());
        assert_eq!(conf.buffer_size, 0);
        assert_eq!(conf.udp.port, 4002);
        assert_eq!(conf.tcp.port, 4003);
        assert_eq!(conf.graphite.host, "127.0.0.1");
        assert_eq!(conf.graphite.port, 2024);
        assert_eq!(conf.graphite.interval, 30);
        assert!(!conf.graphite.debug);
        assert_eq!(conf.logging.sink, LogSink::Console);
        assert_eq!(conf.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            modes = ["udp", "tcp"]
            buffersize = 64
            scriptfile = "/etc/logtrics/scripts/nginx.lua"

            [logging]
            type = "syslog"
            level = "debug"

            [udp]
            host = "0.0.0.0"
            port = 514

            [graphite]
            host = "graphite.internal"
            port = 2003
            interval = 10
            debug = true
        "#;
        let conf: Configuration = toml::from_str(text).unwrap();
        assert_eq!(conf.modes, vec![Mode::Udp, Mode::Tcp]);
        assert_eq!(conf.buffer_size, 64);
        assert_eq!(
            conf.script_file.as_deref(),
            Some(Path::new("/etc/logtrics/scripts/nginx.lua"))
        );
        assert_eq!(conf.logging.sink, LogSink::Syslog);
        assert_eq!(conf.logging.level, LogLevel::Debug);
        assert_eq!(conf.udp.host, "0.0.0.0");
        assert_eq!(conf.udp.port, 514);
        // Untouched sections keep their defaults.
        assert_eq!(conf.tcp.port, 4003);
        assert_eq!(conf.graphite.host, "graphite.internal");
        assert_eq!(conf.graphite.interval, 10);
        assert!(conf.graphite.debug);
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let conf = Configuration::load(Path::new("/nonexistent/logtrics.toml"))
            .await
            .unwrap();
        assert_eq!(conf.graphite.port, 2024);
    }
}
