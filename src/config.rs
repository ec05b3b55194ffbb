//! Layered configuration: defaults, then the config file, then environment variables.
//! Command line flags are applied on top by the binary.

use crate::client::ConnectOptions;
use crate::{muted_error, weak_error};
use log::error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Socket path override.
pub const SOCKET_ENV: &str = "STOPCAST_SOCKET";
/// Console history file override.
pub const HISTORY_ENV: &str = "STOPCAST_HISTORY";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Server socket, see [`default_socket_path`] when not set.
    pub socket: Option<PathBuf>,
    /// Host console history.
    pub history_file: Option<PathBuf>,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Clients reconnect when the server goes away.
    pub reconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: None,
            history_file: None,
            retry_delay_ms: 100,
            max_retry_delay_ms: 2000,
            reconnect: true,
        }
    }
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/stopcast/config.toml";
    const DEFAULT_HISTORY: &'static str = ".stopcast_history";

    /// Load the config file (`~/.config/stopcast/config.toml` if `path` is not set) and apply
    /// environment overrides. A missing or malformed file falls back to defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let file_config = Self::read_file(path).unwrap_or_default();
        file_config.with_env(|name| std::env::var_os(name).map(PathBuf::from))
    }

    fn read_file(path: Option<&Path>) -> Option<Self> {
        let data = match path {
            None => {
                let path = home::home_dir()?.join(Self::DEFAULT_PATH);
                muted_error!(read_to_string(path))?
            }
            Some(path) => match read_to_string(path) {
                Ok(data) => data,
                Err(err) => {
                    error!("load config {}: {err}", path.display());
                    return None;
                }
            },
        };
        weak_error!(Self::parse(&data), "malformed config, defaults used:")
    }

    pub fn parse(data: &str) -> Result<Self, toml::de::Error> {
        toml::de::from_str(data)
    }

    fn with_env(mut self, var: impl Fn(&str) -> Option<PathBuf>) -> Self {
        if let Some(socket) = var(SOCKET_ENV) {
            self.socket = Some(socket);
        }
        if let Some(history) = var(HISTORY_ENV) {
            self.history_file = Some(history);
        }
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(default_socket_path)
    }

    /// Console history file, `~/.stopcast_history` by default.
    pub fn history_path(&self) -> Option<PathBuf> {
        self.history_file
            .clone()
            .or_else(|| Some(home::home_dir()?.join(Self::DEFAULT_HISTORY)))
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            max_retry_delay: Duration::from_millis(self.max_retry_delay_ms.max(self.retry_delay_ms)),
            reconnect: self.reconnect,
            ..ConnectOptions::default()
        }
    }
}

/// `$XDG_RUNTIME_DIR/stopcast-<uid>.sock`, or the same name in the temporary directory.
pub fn default_socket_path() -> PathBuf {
    let dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .filter(|dir| dir.is_dir())
        .unwrap_or_else(std::env::temp_dir);
    dir.join(format!("stopcast-{}.sock", nix::unistd::getuid()))
}
