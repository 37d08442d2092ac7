//! Server configuration
//!
//! Loaded at startup from an optional TOML file. Every field has a default,
//! so the server runs without one. `PORT` overrides the listening port.

use crate::broadcaster::DEFAULT_QUEUE_CAPACITY;
use crate::logging;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "ROOMCALL_CONFIG";
/// Environment variable overriding the port
pub const PORT_ENV: &str = "PORT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ListenSettings,
    pub relay: RelaySettings,
    pub logging: LoggingSettings,
    pub cors: CorsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

/// Queue sizes for message routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Messages waiting for the broadcaster, shared by all rooms
    pub inbound_queue_capacity: usize,
    /// Frames waiting to be written to one connection
    pub outbound_queue_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            inbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// "trace", "debug", "info", "warn" or "error"
    pub level: String,
    /// "text" or "json"
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Allowed browser origins; empty allows any origin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to read environment variables
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(port) = lookup(PORT_ENV) {
            config.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: PORT_ENV,
                value: port,
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.inbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "relay.inbound_queue_capacity",
                value: "0".into(),
            });
        }
        if self.relay.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "relay.outbound_queue_capacity",
                value: "0".into(),
            });
        }
        if !logging::is_valid_level(&self.logging.level) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level",
                value: self.logging.level.clone(),
            });
        }
        if !logging::is_valid_format(&self.logging.format) {
            return Err(ConfigError::InvalidValue {
                key: "logging.format",
                value: self.logging.format.clone(),
            });
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr =
            self.server
                .bind_address
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    key: "server.bind_address",
                    value: self.server.bind_address.clone(),
                })?;
        Ok(SocketAddr::new(ip, self.server.port))
    }
}

impl std::str::FromStr for ServerConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}
