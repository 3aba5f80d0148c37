//! Configuration module
//!
//! Settings are layered, lowest priority first: built-in defaults, a JSON
//! configuration file, `CIPHER_RELAY_*` environment variables, and finally
//! command-line overrides.

pub mod defaults;
mod loader;
mod validator;

pub use self::defaults::ENV_PREFIX;
pub use self::loader::ConfigLoader;
pub use self::validator::ConfigValidator;

use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::crypto::CipherKind;

/// Relay configuration
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP proxy listen address
    #[serde(default = "defaults::http_listen")]
    pub http_listen: SocketAddr,

    /// SOCKS5 listen address
    #[serde(default = "defaults::socks_listen")]
    pub socks_listen: SocketAddr,

    /// Remote relay peer as `host:port`
    #[serde(default = "defaults::relay_server")]
    pub relay_server: String,

    /// Shared secret the cipher key is derived from
    #[serde(default)]
    pub password: String,

    #[serde(default = "defaults::cipher")]
    pub cipher: CipherKind,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "defaults::log_level")]
    pub log_level: String,

    /// Relay read buffer per direction, in bytes
    #[serde(default = "defaults::buffer_size")]
    pub buffer_size: usize,

    /// Upstream CONNECT timeout in seconds
    #[serde(default = "defaults::connect_timeout")]
    pub connect_timeout: u64,

    /// Time allowed to receive a request line, in seconds
    #[serde(default = "defaults::head_timeout")]
    pub head_timeout: u64,

    /// Largest HTTP request head buffered while waiting for CRLF
    #[serde(default = "defaults::max_head_size")]
    pub max_head_size: usize,

    /// Frames queued on the relay link and per channel
    #[serde(default = "defaults::channel_buffer")]
    pub channel_buffer: usize,

    /// Grace period for live connections on shutdown, in seconds
    #[serde(default = "defaults::shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_listen: defaults::http_listen(),
            socks_listen: defaults::socks_listen(),
            relay_server: defaults::relay_server(),
            password: String::new(),
            cipher: defaults::cipher(),
            log_level: defaults::log_level(),
            buffer_size: defaults::buffer_size(),
            connect_timeout: defaults::connect_timeout(),
            head_timeout: defaults::head_timeout(),
            max_head_size: defaults::max_head_size(),
            channel_buffer: defaults::channel_buffer(),
            shutdown_timeout: defaults::shutdown_timeout(),
        }
    }
}

// The password never reaches logs
impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("http_listen", &self.http_listen)
            .field("socks_listen", &self.socks_listen)
            .field("relay_server", &self.relay_server)
            .field("password", &"<redacted>")
            .field("cipher", &self.cipher)
            .field("log_level", &self.log_level)
            .field("buffer_size", &self.buffer_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("head_timeout", &self.head_timeout)
            .field("max_head_size", &self.max_head_size)
            .field("channel_buffer", &self.channel_buffer)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

/// Command-line values; `None` leaves the loaded value in place
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub http_listen: Option<SocketAddr>,
    pub socks_listen: Option<SocketAddr>,
    pub relay_server: Option<String>,
    pub password: Option<String>,
    pub cipher: Option<CipherKind>,
    pub log_level: Option<String>,
    pub buffer_size: Option<usize>,
    pub connect_timeout: Option<u64>,
}

impl RelayConfig {
    /// Apply command-line overrides, the highest-priority layer
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(v) = overrides.http_listen {
            self.http_listen = v;
        }
        if let Some(v) = overrides.socks_listen {
            self.socks_listen = v;
        }
        if let Some(v) = overrides.relay_server {
            self.relay_server = v;
        }
        if let Some(v) = overrides.password {
            self.password = v;
        }
        if let Some(v) = overrides.cipher {
            self.cipher = v;
        }
        if let Some(v) = overrides.log_level {
            self.log_level = v;
        }
        if let Some(v) = overrides.buffer_size {
            self.buffer_size = v;
        }
        if let Some(v) = overrides.connect_timeout {
            self.connect_timeout = v;
        }
    }

    /// The configured level in lowercase, or the default if it names no level
    pub fn effective_log_level(&self) -> String {
        let level = self.log_level.to_lowercase();
        if defaults::LOG_LEVELS.contains(&level.as_str()) {
            level
        } else {
            defaults::log_level()
        }
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn head_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.head_timeout)
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }
}

/// Log the effective configuration, without the password
pub fn log_config(config: &RelayConfig) {
    if !log::log_enabled!(log::Level::Info) {
        return;
    }

    info!("=== Final Configuration ===");
    info!("Network Settings:");
    info!("  HTTP proxy listen address: {}", config.http_listen);
    info!("  SOCKS5 listen address: {}", config.socks_listen);
    info!("  Relay server: {}", config.relay_server);
    info!("Relay Settings:");
    info!("  Cipher: {}", config.cipher);
    info!("  Password: {}", if config.password.is_empty() { "<unset>" } else { "<set>" });
    info!("  Buffer size: {} bytes", config.buffer_size);
    info!("  Channel queue depth: {} frames", config.channel_buffer);
    info!("  Connect timeout: {} seconds", config.connect_timeout);
    info!("  Request head timeout: {} seconds", config.head_timeout);
    info!("  Max request head: {} bytes", config.max_head_size);
    info!("General Settings:");
    info!("  Log level: {}", config.log_level);
    info!("  Shutdown timeout: {} seconds", config.shutdown_timeout);
    info!("==========================");
}
