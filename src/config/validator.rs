//! Configuration validator

use std::net::SocketAddr;

use super::defaults::{LOG_LEVELS, LOG_LEVEL_STR, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use super::RelayConfig;
use crate::common::{ProxyError, Result};

/// Configuration validator trait
pub trait ConfigValidator {
    /// Reject configurations the relay cannot run with
    fn validate(&self) -> Result<()>;

    /// Collect warnings for settings that work but are probably unintended
    fn check(&self) -> Vec<String>;
}

fn invalid(field: &str, reason: impl Into<String>) -> ProxyError {
    ProxyError::Config(format!("Invalid {}: {}", field, reason.into()))
}

impl ConfigValidator for RelayConfig {
    fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            return Err(invalid("password", "a shared password is required"));
        }

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(invalid(
                "buffer_size",
                format!(
                    "{} is outside {}..={} bytes",
                    self.buffer_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
                ),
            ));
        }

        for (field, value) in [
            ("connect_timeout", self.connect_timeout),
            ("head_timeout", self.head_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }

        if self.max_head_size == 0 {
            return Err(invalid("max_head_size", "must be greater than 0"));
        }
        if self.channel_buffer == 0 {
            return Err(invalid("channel_buffer", "must be greater than 0"));
        }

        if self.http_listen == self.socks_listen {
            return Err(invalid(
                "listen addresses",
                format!("HTTP and SOCKS5 listeners both use {}", self.http_listen),
            ));
        }

        match self.relay_server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().map_or(false, |p| p != 0) => {}
            _ => {
                return Err(invalid(
                    "relay_server",
                    format!("expected host:port, got {:?}", self.relay_server),
                ))
            }
        }

        Ok(())
    }

    fn check(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            warnings.push(format!(
                "Invalid log level '{}', using default '{}'",
                self.log_level, LOG_LEVEL_STR
            ));
        }

        for (name, addr) in [("HTTP proxy", self.http_listen), ("SOCKS5", self.socks_listen)] {
            if !is_loopback(&addr) {
                warnings.push(format!(
                    "{} listener on {} accepts connections from other hosts without authentication",
                    name, addr
                ));
            }
        }

        warnings
    }
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}
