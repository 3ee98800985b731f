//! Server configuration.
//!
//! A [`ServerConfig`] can be built in code, or read from a TOML file shaped like:
//!
//! ```toml
//! [server]
//! address = "0.0.0.0"
//! port = 8080
//! backlog = 16
//! read_timeout_ms = 30000
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Every key is optional; missing keys fall back to the [`Default`] values.
use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),
}

/// Listening socket and per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Interface to bind.
    pub address: String,
    /// TCP port, `0` for an ephemeral one.
    pub port: u16,
    /// Pending-connection queue depth.
    pub backlog: i32,
    /// Read timeout applied to accepted connections. `None` lets a silent
    /// peer hold its connection open indefinitely.
    pub read_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: 0,
            backlog: default_backlog(),
            read_timeout: None,
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(file.into())
    }

    pub fn ip(&self) -> Result<IpAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_address")]
    address: String,
    #[serde(default)]
    port: u16,
    #[serde(default = "default_backlog")]
    backlog: i32,
    read_timeout_ms: Option<u64>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: 0,
            backlog: default_backlog(),
            read_timeout_ms: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingSection {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl From<FileConfig> for ServerConfig {
    fn from(value: FileConfig) -> Self {
        Self {
            address: value.server.address,
            port: value.server.port,
            backlog: value.server.backlog,
            read_timeout: value.server.read_timeout_ms.map(Duration::from_millis),
            log_level: value.logging.level,
        }
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_backlog() -> i32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}
