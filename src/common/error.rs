//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use thiserror::Error;
use std::io;

use crate::registry::ConnectionId;

/// Cipher relay error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// Malformed client request (request line, URI, SOCKS5 frame)
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// The relay peer refused or failed the CONNECT request
    #[error("Upstream connect error: {0}")]
    UpstreamConnect(String),

    /// Read/write failure on either leg of an established relay
    #[error("Relay error: {0}")]
    Relay(String),

    /// A session was registered twice for the same live connection
    #[error("Session already registered for connection {0}")]
    DuplicateSession(ConnectionId),

    /// No session is registered for the connection
    #[error("No session registered for connection {0}")]
    SessionNotFound(ConnectionId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

impl From<config::ConfigError> for ProxyError {
    fn from(err: config::ConfigError) -> Self {
        ProxyError::Config(err.to_string())
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
