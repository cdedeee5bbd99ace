//! Configuration loading
//!
//! The server reads a TOML file into [`Config`], fills in defaults for
//! missing or non-positive limits, validates the listener setup, and
//! resolves everything the chat core needs into [`Settings`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::client::DEFAULT_OUTBOUND_QUEUE;
use crate::transport::{TransportConfig, DEFAULT_MAX_LINE_LEN, WRITE_TIMEOUT};

/// Ports at or below this need `allow_privileged_port`
pub const PRIVILEGED_PORT_MAX: u16 = 1000;

const DEFAULT_MAX_CONNS_PER_IP: i64 = 4;
const DEFAULT_MAX_MSGS_PER_SEC: i64 = 1;
const DEFAULT_KEEPALIVE_SECS: i64 = 120;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Invalid TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parse but cannot be used
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Raw configuration file contents
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server name, reported in stats snapshots
    pub name: String,
    /// Message of the day, one `MOTD` line per non-empty line
    pub motd: String,
    pub allow_privileged_port: bool,

    pub max_conns_per_ip: i64,
    pub max_msgs_per_sec: i64,
    /// Maximum line size in bytes
    pub max_msg_size: i64,
    /// Idle read timeout in seconds
    pub max_keepalive_timeout: i64,
    /// Per-client outbound queue capacity
    pub outbound_queue: usize,

    pub bind_address: String,
    pub stats_file: Option<PathBuf>,
    pub stats_interval_secs: u64,

    pub server: ListenersConfig,
}

/// Listener sections: `[server.tcp]` and `[server.tls]`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ListenersConfig {
    pub tcp: TcpListenerConfig,
    pub tls: TlsListenerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TcpListenerConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsListenerConfig {
    pub enabled: bool,
    pub port: u16,
    #[serde(rename = "ssl_cert")]
    pub cert: Option<PathBuf>,
    #[serde(rename = "ssl_key")]
    pub key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "linechat".to_string(),
            motd: String::new(),
            allow_privileged_port: false,
            max_conns_per_ip: DEFAULT_MAX_CONNS_PER_IP,
            max_msgs_per_sec: DEFAULT_MAX_MSGS_PER_SEC,
            max_msg_size: DEFAULT_MAX_LINE_LEN as i64,
            max_keepalive_timeout: DEFAULT_KEEPALIVE_SECS,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            bind_address: "0.0.0.0".to_string(),
            stats_file: None,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            server: ListenersConfig::default(),
        }
    }
}

impl Config {
    /// Read, normalize and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse, normalize and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Replace missing or non-positive limits with defaults
    pub fn normalize(&mut self) {
        if self.max_msg_size <= 0 {
            self.max_msg_size = DEFAULT_MAX_LINE_LEN as i64;
        }
        if self.max_conns_per_ip <= 0 {
            self.max_conns_per_ip = DEFAULT_MAX_CONNS_PER_IP;
        }
        if self.max_msgs_per_sec <= 0 {
            self.max_msgs_per_sec = DEFAULT_MAX_MSGS_PER_SEC;
        }
        if self.max_keepalive_timeout <= 0 {
            self.max_keepalive_timeout = DEFAULT_KEEPALIVE_SECS;
        }
        if self.outbound_queue == 0 {
            self.outbound_queue = DEFAULT_OUTBOUND_QUEUE;
        }
        if self.stats_interval_secs == 0 {
            self.stats_interval_secs = DEFAULT_STATS_INTERVAL_SECS;
        }
        self.motd = strip_blank_edges(&self.motd);
    }

    /// Check the listener setup
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tcp = &self.server.tcp;
        let tls = &self.server.tls;

        if !tcp.enabled && !tls.enabled {
            return Err(ConfigError::Invalid(
                "no tcp or tls listener enabled, nothing to do".to_string(),
            ));
        }
        if tcp.enabled && tcp.port == 0 {
            return Err(ConfigError::Invalid("tcp enabled but no port defined".to_string()));
        }
        if tls.enabled && tls.port == 0 {
            return Err(ConfigError::Invalid("tls enabled but no port defined".to_string()));
        }
        if tls.enabled && (tls.cert.is_none() || tls.key.is_none()) {
            return Err(ConfigError::Invalid(
                "tls enabled but ssl_cert or ssl_key not defined".to_string(),
            ));
        }

        if !self.allow_privileged_port {
            let privileged = [(tcp.enabled, tcp.port), (tls.enabled, tls.port)]
                .into_iter()
                .any(|(enabled, port)| enabled && port <= PRIVILEGED_PORT_MAX);
            if privileged {
                return Err(ConfigError::Invalid(format!(
                    "refusing to listen on a privileged port (<= {}); set allow_privileged_port to allow it",
                    PRIVILEGED_PORT_MAX
                )));
            }
        }

        Ok(())
    }

    /// Non-empty MOTD lines, carriage returns removed
    pub fn motd_lines(&self) -> Vec<String> {
        self.motd
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    /// Resolve the values the chat core consumes
    pub fn settings(&self) -> Settings {
        Settings {
            name: self.name.clone(),
            max_conns_per_ip: positive_or(self.max_conns_per_ip, DEFAULT_MAX_CONNS_PER_IP) as usize,
            max_msgs_per_sec: positive_or(self.max_msgs_per_sec, DEFAULT_MAX_MSGS_PER_SEC)
                .min(u32::MAX as i64) as u32,
            outbound_queue: self.outbound_queue.max(1),
            motd: self.motd_lines(),
            transport: TransportConfig {
                max_line_len: positive_or(self.max_msg_size, DEFAULT_MAX_LINE_LEN as i64) as usize,
                idle_timeout: Duration::from_secs(
                    positive_or(self.max_keepalive_timeout, DEFAULT_KEEPALIVE_SECS) as u64,
                ),
                write_timeout: WRITE_TIMEOUT,
            },
        }
    }
}

/// Resolved runtime settings for the chat core
#[derive(Debug, Clone)]
pub struct Settings {
    pub name: String,
    pub max_conns_per_ip: usize,
    pub max_msgs_per_sec: u32,
    pub outbound_queue: usize,
    pub motd: Vec<String>,
    pub transport: TransportConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Config::default().settings()
    }
}

fn positive_or(value: i64, default: i64) -> i64 {
    if value > 0 {
        value
    } else {
        default
    }
}

fn strip_blank_edges(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let is_blank = |line: &&str| line.trim().is_empty();
    let start = lines.iter().position(|l| !is_blank(l));
    let end = lines.iter().rposition(|l| !is_blank(l));
    match (start, end) {
        (Some(start), Some(end)) => lines[start..=end].join("\n"),
        _ => String::new(),
    }
}
