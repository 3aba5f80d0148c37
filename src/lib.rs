//! Cipher Relay Local: HTTP and SOCKS5 front-end for an encrypted relay tunnel
//!
//! Local applications speak plain HTTP-proxy or SOCKS5 to this process. Each
//! accepted connection is given a virtual channel on a single multiplexed
//! link to the remote relay; bytes headed upstream are encrypted with a
//! stream cipher and bytes coming back are decrypted before they reach the
//! application.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cipher_relay_local::config::RelayConfig;
//! use cipher_relay_local::crypto::AesCrypto;
//! use cipher_relay_local::proxy::{ProxyContext, ProxyService, StandardProxyService};
//! use cipher_relay_local::registry::ConnectionRegistry;
//! use cipher_relay_local::relay::MuxRelayClient;
//! use cipher_relay_local::stats::RelayMetrics;
//!
//! #[tokio::main]
//! async fn main() -> cipher_relay_local::Result<()> {
//!     let config = RelayConfig {
//!         password: "secret".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let client = MuxRelayClient::connect(&config.relay_server, config.channel_buffer, config.buffer_size).await?;
//!     let cipher = AesCrypto::new(config.cipher, &config.password);
//!     let ctx = ProxyContext::new(
//!         Arc::new(config),
//!         Arc::new(client),
//!         Arc::new(cipher),
//!         RelayMetrics::shared(),
//!         Arc::new(ConnectionRegistry::new()),
//!     );
//!
//!     let handle = StandardProxyService::new(Arc::new(ctx)).start()?;
//!     tokio::signal::ctrl_c().await?;
//!     handle.shutdown().await
//! }
//! ```

pub mod common;
pub mod config;
pub mod crypto;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod relay;
pub mod stats;

pub use common::{ProxyError, Result};
pub use config::RelayConfig;
pub use proxy::{ProxyHandle, ProxyService, StandardProxyService};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
