// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

/// Broker configuration, read from a TOML file:
///
/// ```toml
/// [general]
/// connect_timeout = 10
///
/// [[listeners]]
/// protocol = "mqtt"
/// address = "0.0.0.0:1883"
///
/// [[listeners]]
/// protocol = "mqtts"
/// address = "0.0.0.0:8883"
/// cert_file = "/etc/shrike/fullchain.pem"
/// key_file = "/etc/shrike/key.pem"
///
/// [log]
/// level = "info"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,

    #[serde(default = "default_listeners")]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: General::default(),
            listeners: default_listeners(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Read and parse the config file at `path`.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = fs::read_to_string(&path).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("Failed to read config file {:?}: {err}", path.as_ref()),
            )
        })?;
        toml::from_str(&content).map_err(|err| {
            Error::from_string(
                ErrorKind::ConfigError,
                format!("Invalid config file {:?}: {err}", path.as_ref()),
            )
        })
    }
}

fn default_listeners() -> Vec<ListenerConfig> {
    vec![ListenerConfig::default()]
}

/// General section in config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct General {
    /// Seconds a fresh connection may take to present its CONNECT packet.
    ///
    /// Default is 10s.
    #[serde(default = "General::default_connect_timeout")]
    connect_timeout: u64,

    /// Directory for session and retained-message records. When unset, state
    /// lives in memory and dies with the process.
    #[serde(default)]
    storage_dir: Option<PathBuf>,
}

impl General {
    const fn default_connect_timeout() -> u64 {
        10
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> u64 {
        self.connect_timeout
    }

    #[must_use]
    pub const fn storage_dir(&self) -> Option<&PathBuf> {
        self.storage_dir.as_ref()
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            connect_timeout: Self::default_connect_timeout(),
            storage_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain TCP, default port 1883.
    Mqtt,

    /// TCP over TLS, default port 8883.
    Mqtts,

    /// Websocket.
    Ws,

    /// Secure websocket.
    Wss,
}

/// One `[[listeners]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub protocol: Protocol,

    /// Bind address, `host:port`.
    pub address: String,

    /// PEM certificate chain, required for `mqtts`/`wss`.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// PEM private key, required for `mqtts`/`wss`.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Mqtt,
            address: "0.0.0.0:1883".to_string(),
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Log section in config.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    level: LogLevel,
}

impl LogConfig {
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }
}
