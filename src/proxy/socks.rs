//! SOCKS5 front-end
//!
//! The handshake stage negotiates, reads the command request and registers
//! the session; `Socks5ConnectHandler` then issues the upstream CONNECT and
//! drives the relay.

use bytes::Bytes;
use log::{debug, info};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use super::context::ProxyContext;
use crate::common::{ProxyError, Result};
use crate::protocol::socks5::{negotiate, read_command_request, CMD_CONNECT};
use crate::protocol::{Socks5CommandRequest, Socks5CommandResponse, Socks5Status};
use crate::registry::{ConnectionId, ProxyType, Session};
use crate::relay::{connect_upstream, ChannelLease};
use crate::stats::RequestKind;

/// Serve one SOCKS5 connection until it closes
pub async fn serve_socks5<S>(
    ctx: &ProxyContext,
    id: ConnectionId,
    mut stream: S,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let request = match handshake(&mut stream, ctx.config.head_timeout_duration()).await {
        Ok(request) => request,
        Err(e) => {
            ctx.metrics.decode_error();
            return Err(e);
        }
    };

    if request.command != CMD_CONNECT {
        let reply = Socks5CommandResponse::error(
            Socks5Status::CommandNotSupported,
            request.address.addr_type(),
        );
        stream.write_all(&reply.encode()).await?;
        return Err(ProxyError::ProtocolDecode(format!(
            "unsupported SOCKS5 command {:#04x}",
            request.command
        )));
    }

    ctx.metrics.request(RequestKind::Socks5);
    let _session = ctx
        .registry
        .register(Session::new(id, peer, ProxyType::Tunnel, request.target()))?;
    info!("{} {} -> {} (socks5)", id, peer, request.target());

    Socks5ConnectHandler::new(ctx).handle(id, stream, request).await
}

async fn handshake<S>(stream: &mut S, limit: Duration) -> Result<Socks5CommandRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        negotiate(stream).await?;
        read_command_request(stream).await
    };

    match timeout(limit, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::ProtocolDecode(
            "SOCKS5 handshake not completed in time".to_string(),
        )),
    }
}

/// Connects a decoded SOCKS5 request through the relay
pub struct Socks5ConnectHandler<'a> {
    ctx: &'a ProxyContext,
}

impl<'a> Socks5ConnectHandler<'a> {
    pub fn new(ctx: &'a ProxyContext) -> Self {
        Self { ctx }
    }

    /// Issue the upstream CONNECT and relay on success
    ///
    /// The session must already be registered for `id`. On failure the
    /// client gets a general-failure reply and no channel is opened.
    pub async fn handle<S>(&self, id: ConnectionId, mut stream: S, request: Socks5CommandRequest) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let ctx = self.ctx;
        let session = ctx.registry.get(id).ok_or(ProxyError::SessionNotFound(id))?;
        let failure = Socks5CommandResponse::failure(request.address.addr_type());

        let channel = match connect_upstream(
            ctx.client.as_ref(),
            &session.target,
            ctx.config.connect_timeout_duration(),
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                ctx.metrics.upstream_connect_failed();
                stream.write_all(&failure.encode()).await?;
                return Err(e);
            }
        };

        let lease = ChannelLease::new(ctx.client.clone(), channel);
        let upstream = match ctx.client.open_channel(channel) {
            Ok(upstream) => upstream,
            Err(e) => {
                ctx.release_unused(lease);
                ctx.metrics.upstream_connect_failed();
                stream.write_all(&failure.encode()).await?;
                return Err(e);
            }
        };

        if let Err(e) = stream
            .write_all(&Socks5CommandResponse::success(&request).encode())
            .await
        {
            ctx.release_unused(lease);
            return Err(e.into());
        }
        debug!("{} connected over {}", id, channel);

        let stats = ctx.engine.run(id, stream, lease, upstream, Bytes::new()).await?;
        info!(
            "{} finished: {} bytes up, {} bytes down",
            id, stats.bytes_upstream, stats.bytes_downstream
        );
        Ok(())
    }
}
