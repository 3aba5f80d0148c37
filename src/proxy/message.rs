//! Proxy message types
//!
//! The running service is controlled through messages rather than shared
//! state, so the accept loop never waits on a lock.

use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};

use crate::common::{ProxyError, Result};

/// Point-in-time view of the running service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    /// Connection tasks still running
    pub active_connections: usize,
    /// Sessions in the connection registry
    pub sessions: usize,
    /// Connections currently inside the relay engine
    pub relays_active: u64,
}

/// Messages that can be sent to the proxy service
#[derive(Debug)]
pub enum ProxyMessage {
    /// Stop accepting, drain live connections, then acknowledge on `done`
    Shutdown {
        done: oneshot::Sender<()>,
    },
    /// Report current statistics
    Snapshot {
        reply: oneshot::Sender<ServiceStats>,
    },
}

/// Proxy control handle
///
/// Cheap to clone; every clone talks to the same service task.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    sender: mpsc::Sender<ProxyMessage>,
    http_addr: SocketAddr,
    socks_addr: SocketAddr,
}

impl ProxyHandle {
    pub fn new(sender: mpsc::Sender<ProxyMessage>, http_addr: SocketAddr, socks_addr: SocketAddr) -> Self {
        Self {
            sender,
            http_addr,
            socks_addr,
        }
    }

    /// Address the HTTP proxy listener is bound to
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Address the SOCKS5 listener is bound to
    pub fn socks_addr(&self) -> SocketAddr {
        self.socks_addr
    }

    /// Send a message to the proxy service
    pub async fn send(&self, message: ProxyMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ProxyError::Other("Failed to send message to proxy service".to_string()))
    }

    /// Fetch current service statistics
    pub async fn snapshot(&self) -> Result<ServiceStats> {
        let (reply, rx) = oneshot::channel();
        self.send(ProxyMessage::Snapshot { reply }).await?;
        rx.await
            .map_err(|_| ProxyError::Other("Proxy service stopped before replying".to_string()))
    }

    /// Shut the service down and wait until it has drained
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.send(ProxyMessage::Shutdown { done }).await?;
        rx.await
            .map_err(|_| ProxyError::Other("Proxy service stopped before acknowledging shutdown".to_string()))
    }
}

/// Create a new proxy message channel
pub fn create_channel(
    http_addr: SocketAddr,
    socks_addr: SocketAddr,
) -> (ProxyHandle, mpsc::Receiver<ProxyMessage>) {
    let (tx, rx) = mpsc::channel(100);
    (ProxyHandle::new(tx, http_addr, socks_addr), rx)
}
