//! Default configuration values
//!
//! Single source of truth for defaults, shared by `RelayConfig::default`
//! and the serde field defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::crypto::CipherKind;

/// Environment variable prefix for all configuration options
///
/// `CIPHER_RELAY_BUFFER_SIZE=16384` sets `buffer_size`.
pub const ENV_PREFIX: &str = "CIPHER_RELAY";

/// Environment variable naming the configuration file
pub const CONFIG_FILE_ENV: &str = "CIPHER_RELAY_CONFIG_FILE";

/// Default configuration file name, read when present
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Smallest accepted relay buffer
pub const MIN_BUFFER_SIZE: usize = 512;

/// Largest accepted relay buffer (1 MiB)
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Default relay server address as string
pub const RELAY_SERVER_STR: &str = "127.0.0.1:9000";

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Levels accepted for `log_level`
pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Default HTTP proxy listen address
pub fn http_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080)
}

/// Default SOCKS5 listen address
pub fn socks_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1080)
}

pub fn relay_server() -> String {
    RELAY_SERVER_STR.to_string()
}

pub fn cipher() -> CipherKind {
    CipherKind::Aes256Ctr
}

pub fn log_level() -> String {
    LOG_LEVEL_STR.to_string()
}

/// Default buffer size (8KB)
pub fn buffer_size() -> usize {
    8192
}

/// Default upstream connect timeout in seconds
pub fn connect_timeout() -> u64 {
    30
}

/// Default time allowed for a complete request line, in seconds
pub fn head_timeout() -> u64 {
    10
}

/// Default cap on a buffered HTTP request head
pub fn max_head_size() -> usize {
    8192
}

/// Default depth of the link frame queue and each channel queue
pub fn channel_buffer() -> usize {
    64
}

/// Default grace period for live connections on shutdown, in seconds
pub fn shutdown_timeout() -> u64 {
    30
}
