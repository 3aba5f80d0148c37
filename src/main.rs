//! Cipher Relay Local command line tool
//!
//! Loads configuration, connects the relay link and serves the HTTP and
//! SOCKS5 front-ends until Ctrl-C.

use clap::Parser;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cipher_relay_local::common::{init_logger, Result};
use cipher_relay_local::config::{
    defaults::CONFIG_FILE_ENV, log_config, ConfigLoader, ConfigOverrides, ConfigValidator,
    RelayConfig,
};
use cipher_relay_local::crypto::{AesCrypto, CipherKind};
use cipher_relay_local::proxy::{ProxyContext, ProxyService, StandardProxyService};
use cipher_relay_local::registry::ConnectionRegistry;
use cipher_relay_local::relay::MuxRelayClient;
use cipher_relay_local::stats::RelayMetrics;
use cipher_relay_local::{APP_NAME, VERSION};

/// Cipher Relay Local: HTTP and SOCKS5 front-end for an encrypted relay tunnel
#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Load configuration from a JSON file
    #[arg(long, env = CONFIG_FILE_ENV)]
    config_file: Option<PathBuf>,

    /// HTTP proxy listen address
    #[arg(long)]
    http_listen: Option<SocketAddr>,

    /// SOCKS5 listen address
    #[arg(long)]
    socks_listen: Option<SocketAddr>,

    /// Remote relay server (host:port)
    #[arg(short, long)]
    relay_server: Option<String>,

    /// Shared password the cipher key is derived from
    #[arg(short, long)]
    password: Option<String>,

    /// Stream cipher (aes-128-ctr, aes-256-ctr)
    #[arg(long)]
    cipher: Option<CipherKind>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Relay read buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Upstream connect timeout in seconds
    #[arg(long)]
    connect_timeout: Option<u64>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            http_listen: self.http_listen,
            socks_listen: self.socks_listen,
            relay_server: self.relay_server.clone(),
            password: self.password.clone(),
            cipher: self.cipher,
            log_level: self.log_level.clone(),
            buffer_size: self.buffer_size,
            connect_timeout: self.connect_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RelayConfig::load(args.config_file.as_deref())?;
    config.apply_overrides(args.overrides());

    // Check before normalising so a bad level is still reported
    let warnings = config.check();
    config.log_level = config.effective_log_level();
    init_logger(&config.log_level);
    info!("Starting {} v{}", APP_NAME, VERSION);

    for warning in warnings {
        warn!("{}", warning);
    }
    config.validate()?;
    log_config(&config);

    let cipher = AesCrypto::new(config.cipher, &config.password);
    let client = MuxRelayClient::connect(&config.relay_server, config.channel_buffer, config.buffer_size).await?;

    let ctx = ProxyContext::new(
        Arc::new(config),
        Arc::new(client),
        Arc::new(cipher),
        RelayMetrics::shared(),
        Arc::new(ConnectionRegistry::new()),
    );

    let handle = StandardProxyService::new(Arc::new(ctx)).start()?;
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, shutting down...");

    handle.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
