//! Network utility functions

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use super::error::Result;

/// Listen backlog for both front-end listeners
const LISTEN_BACKLOG: i32 = 1024;

/// Bind a non-blocking TCP listener with `SO_REUSEADDR` set
///
/// Restarting the relay while old client sockets sit in TIME_WAIT must not
/// fail the bind.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener = TcpListener::from_std(socket.into())?;
    Ok(listener)
}

/// Format a host and port as a `host:port` authority
///
/// IPv6 literals are bracketed so the result parses back unambiguously.
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
