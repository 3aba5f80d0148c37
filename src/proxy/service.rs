//! Proxy service implementation
//!
//! Owns both listeners and the set of connection tasks. Each accepted socket
//! gets its own task; a failing connection is logged and affects nothing else.

use log::{debug, error, info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::context::ProxyContext;
use super::http::serve_http;
use super::message::{create_channel, ProxyHandle, ProxyMessage, ServiceStats};
use super::socks::serve_socks5;
use crate::common::{bind_listener, ProxyError, Result};
use crate::registry::ConnectionId;

/// Proxy service trait
pub trait ProxyService {
    /// Bind the listeners and start serving in the background
    fn start(self) -> Result<ProxyHandle>;
}

/// Which listener accepted a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frontend {
    Http,
    Socks5,
}

impl fmt::Display for Frontend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frontend::Http => write!(f, "HTTP"),
            Frontend::Socks5 => write!(f, "SOCKS5"),
        }
    }
}

/// HTTP proxy plus SOCKS5 front-ends sharing one `ProxyContext`
pub struct StandardProxyService {
    http_listen: SocketAddr,
    socks_listen: SocketAddr,
    ctx: Arc<ProxyContext>,
}

impl StandardProxyService {
    /// Listen on the addresses from the context's configuration
    pub fn new(ctx: Arc<ProxyContext>) -> Self {
        let http_listen = ctx.config.http_listen;
        let socks_listen = ctx.config.socks_listen;
        Self::with_listeners(ctx, http_listen, socks_listen)
    }

    pub fn with_listeners(ctx: Arc<ProxyContext>, http_listen: SocketAddr, socks_listen: SocketAddr) -> Self {
        Self {
            http_listen,
            socks_listen,
            ctx,
        }
    }

    async fn run_service(
        http: TcpListener,
        socks: TcpListener,
        ctx: Arc<ProxyContext>,
        mut rx: mpsc::Receiver<ProxyMessage>,
    ) {
        let mut tasks: JoinSet<()> = JoinSet::new();

        let done = loop {
            select! {
                accepted = http.accept() => match accepted {
                    Ok((stream, peer)) => spawn_connection(&mut tasks, &ctx, Frontend::Http, stream, peer),
                    Err(e) => error!("Error accepting HTTP connection: {}", e),
                },

                accepted = socks.accept() => match accepted {
                    Ok((stream, peer)) => spawn_connection(&mut tasks, &ctx, Frontend::Socks5, stream, peer),
                    Err(e) => error!("Error accepting SOCKS5 connection: {}", e),
                },

                Some(message) = rx.recv() => match message {
                    ProxyMessage::Shutdown { done } => {
                        info!("Received shutdown message");
                        break done;
                    }
                    ProxyMessage::Snapshot { reply } => {
                        let _ = reply.send(ServiceStats {
                            active_connections: tasks.len(),
                            sessions: ctx.registry.len(),
                            relays_active: ctx.metrics.relays_active(),
                        });
                    }
                },

                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        };

        drop(http);
        drop(socks);

        if !tasks.is_empty() {
            info!("Waiting for {} connections to complete...", tasks.len());
            let drain = async { while tasks.join_next().await.is_some() {} };
            if timeout(ctx.config.shutdown_timeout_duration(), drain).await.is_err() {
                warn!("Shutdown timeout reached, {} connections still active", tasks.len());
                tasks.shutdown().await;
            }
        }

        info!("Proxy service shutdown complete");
        let _ = done.send(());
    }
}

fn spawn_connection(
    tasks: &mut JoinSet<()>,
    ctx: &Arc<ProxyContext>,
    frontend: Frontend,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let ctx = Arc::clone(ctx);
    tasks.spawn(async move {
        let id = ConnectionId::next();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", id, e);
        }
        ctx.metrics.connection_opened();
        debug!("Accepted {} from {} on the {} listener", id, peer, frontend);

        let result = match frontend {
            Frontend::Http => serve_http(&ctx, id, stream, peer).await,
            Frontend::Socks5 => serve_socks5(&ctx, id, stream, peer).await,
        };

        ctx.metrics.connection_closed();
        if let Err(e) = result {
            log_connection_error(id, peer, &e);
        }
    });
}

fn log_connection_error(id: ConnectionId, peer: SocketAddr, error: &ProxyError) {
    match error {
        ProxyError::Io(_) => debug!("Connection {} from {} ended: {}", id, peer, error),
        ProxyError::ProtocolDecode(_) | ProxyError::UpstreamConnect(_) | ProxyError::Relay(_) => {
            warn!("Connection {} from {} failed: {}", id, peer, error)
        }
        _ => error!("Connection {} from {} failed: {}", id, peer, error),
    }
}

impl ProxyService for StandardProxyService {
    fn start(self) -> Result<ProxyHandle> {
        let http = bind_listener(self.http_listen)?;
        let socks = bind_listener(self.socks_listen)?;
        let http_addr = http.local_addr()?;
        let socks_addr = socks.local_addr()?;

        info!("HTTP proxy listening on {}", http_addr);
        info!("SOCKS5 proxy listening on {}", socks_addr);
        info!("Relaying through {}", self.ctx.config.relay_server);

        let (handle, rx) = create_channel(http_addr, socks_addr);
        tokio::spawn(Self::run_service(http, socks, self.ctx, rx));

        Ok(handle)
    }
}
