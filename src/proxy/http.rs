//! HTTP proxy front-end
//!
//! Reads the request line, then either serves the local metrics page or
//! registers a session, issues the upstream CONNECT and hands the socket to
//! the relay engine.

use bytes::{Bytes, BytesMut};
use log::{debug, info};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

use super::context::ProxyContext;
use crate::common::{ProxyError, Result};
use crate::protocol::http_head::{
    connection_established, find_head_end, status_page, BAD_GATEWAY, BAD_REQUEST,
};
use crate::protocol::{decode_request_head, HeadDecode, LocalRequest, ProxyRequestHead};
use crate::registry::{ConnectionId, ProxyType, Session};
use crate::relay::{connect_upstream, ChannelLease};
use crate::stats::RequestKind;

/// Initial capacity of the request-head buffer
const HEAD_CHUNK: usize = 1024;

/// Serve one HTTP proxy connection until it closes
pub async fn serve_http<S>(
    ctx: &ProxyContext,
    id: ConnectionId,
    mut stream: S,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let limit = ctx.config.max_head_size;
    let deadline = Instant::now() + ctx.config.head_timeout_duration();
    let mut buf = BytesMut::with_capacity(HEAD_CHUNK);

    let head = loop {
        match decode_request_head(&buf) {
            Ok(HeadDecode::Incomplete) => {}
            Ok(HeadDecode::Proxy(head)) => break head,
            Ok(HeadDecode::LocalStatus(request)) => return serve_status(ctx, &mut stream, request).await,
            Err(e) => return reject(ctx, &mut stream, e).await,
        }

        match read_more(&mut stream, &mut buf, limit, deadline).await {
            Ok(0) if buf.is_empty() => {
                debug!("{} closed before sending a request", id);
                return Ok(());
            }
            Ok(0) => {
                let e = ProxyError::ProtocolDecode("connection closed inside the request line".to_string());
                return reject(ctx, &mut stream, e).await;
            }
            Ok(_) => {}
            Err(e @ ProxyError::ProtocolDecode(_)) => return reject(ctx, &mut stream, e).await,
            Err(e) => return Err(e),
        }
    };

    relay_request(ctx, id, stream, peer, head, buf, deadline).await
}

async fn relay_request<S>(
    ctx: &ProxyContext,
    id: ConnectionId,
    mut stream: S,
    peer: SocketAddr,
    head: ProxyRequestHead,
    mut buf: BytesMut,
    deadline: Instant,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    ctx.metrics.request(match head.proxy_type {
        ProxyType::Tunnel => RequestKind::HttpTunnel,
        ProxyType::Web => RequestKind::HttpWeb,
    });

    let target = head.target();
    let _session = ctx
        .registry
        .register(Session::new(id, peer, head.proxy_type, target.clone()))?;
    info!("{} {} -> {} ({})", id, peer, target, head.proxy_type);

    let initial: Bytes = match head.proxy_type {
        ProxyType::Web => head.payload.clone(),
        // Headers of the CONNECT itself are for us; whatever follows is tunnel data
        ProxyType::Tunnel => loop {
            if let Some(end) = find_head_end(&buf) {
                break buf.split_off(end).freeze();
            }
            match read_more(&mut stream, &mut buf, ctx.config.max_head_size, deadline).await {
                Ok(0) => {
                    return Err(ProxyError::ProtocolDecode(
                        "connection closed inside CONNECT headers".to_string(),
                    ))
                }
                Ok(_) => {}
                Err(e @ ProxyError::ProtocolDecode(_)) => return reject(ctx, &mut stream, e).await,
                Err(e) => return Err(e),
            }
        },
    };

    let channel = match connect_upstream(
        ctx.client.as_ref(),
        &target,
        ctx.config.connect_timeout_duration(),
    )
    .await
    {
        Ok(channel) => channel,
        Err(e) => return bad_gateway(ctx, &mut stream, e).await,
    };

    let lease = ChannelLease::new(ctx.client.clone(), channel);
    let upstream = match ctx.client.open_channel(channel) {
        Ok(upstream) => upstream,
        Err(e) => {
            ctx.release_unused(lease);
            return bad_gateway(ctx, &mut stream, e).await;
        }
    };

    if head.proxy_type == ProxyType::Tunnel {
        if let Err(e) = stream.write_all(&connection_established(&head.version)).await {
            ctx.release_unused(lease);
            return Err(e.into());
        }
    }

    let stats = ctx.engine.run(id, stream, lease, upstream, initial).await?;
    info!(
        "{} finished: {} bytes up, {} bytes down",
        id, stats.bytes_upstream, stats.bytes_downstream
    );
    Ok(())
}

/// Read more of the request head, bounded in size and time
async fn read_more<R>(reader: &mut R, buf: &mut BytesMut, limit: usize, deadline: Instant) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    if buf.len() >= limit {
        return Err(ProxyError::ProtocolDecode(format!(
            "request head exceeds {} bytes",
            limit
        )));
    }
    buf.reserve(HEAD_CHUNK);

    match timeout_at(deadline, reader.read_buf(buf)).await {
        Ok(read) => Ok(read?),
        Err(_) => Err(ProxyError::ProtocolDecode(
            "request head not received in time".to_string(),
        )),
    }
}

async fn serve_status<S>(ctx: &ProxyContext, stream: &mut S, request: LocalRequest) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug!("Serving metrics for {} {} {}", request.method, request.path, request.version);
    ctx.metrics.status_request();
    let page = status_page(&ctx.metrics.scrape());
    stream.write_all(&page).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Answer 400 and close; no session exists for the connection
async fn reject<S>(ctx: &ProxyContext, stream: &mut S, error: ProxyError) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    ctx.metrics.decode_error();
    let _ = stream.write_all(BAD_REQUEST).await;
    let _ = stream.shutdown().await;
    Err(error)
}

async fn bad_gateway<S>(ctx: &ProxyContext, stream: &mut S, error: ProxyError) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    ctx.metrics.upstream_connect_failed();
    let _ = stream.write_all(BAD_GATEWAY).await;
    let _ = stream.shutdown().await;
    Err(error)
}
