//! Relay engine
//!
//! Pumps bytes between a client socket and an upstream virtual channel,
//! encrypting what goes up and decrypting what comes down.

use bytes::{Bytes, BytesMut};
use log::debug;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::client::{BoxedChannelIo, ChannelLease};
use crate::common::{ProxyError, Result};
use crate::crypto::{StreamCipher, StreamTransform, IV_LEN};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::stats::{Direction, RelayMetrics};

/// Plaintext byte counts of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
}

pub struct RelayEngine {
    cipher: Arc<dyn StreamCipher>,
    metrics: Arc<RelayMetrics>,
    registry: Arc<ConnectionRegistry>,
    buffer_size: usize,
}

/// Teardown that must happen however `run` exits, including cancellation
struct ActiveRelay<'a> {
    engine: &'a RelayEngine,
    conn: ConnectionId,
    lease: ChannelLease,
}

impl Drop for ActiveRelay<'_> {
    fn drop(&mut self) {
        if self.lease.release() {
            self.engine.metrics.channel_released();
        }
        self.engine.registry.remove(self.conn);
        self.engine.metrics.relay_finished();
    }
}

impl RelayEngine {
    pub fn new(
        cipher: Arc<dyn StreamCipher>,
        metrics: Arc<RelayMetrics>,
        registry: Arc<ConnectionRegistry>,
        buffer_size: usize,
    ) -> Self {
        Self {
            cipher,
            metrics,
            registry,
            buffer_size: buffer_size.max(1),
        }
    }

    /// Relay until either side closes or fails
    ///
    /// `initial` is encrypted and sent upstream before anything read from the
    /// client. On return both writers have been shut down, the channel has
    /// been released and the connection's session removed.
    ///
    /// # Errors
    ///
    /// `ProxyError::Relay` if either leg failed with an I/O or cipher error.
    pub async fn run<S>(
        &self,
        conn: ConnectionId,
        client: S,
        lease: ChannelLease,
        channel: BoxedChannelIo,
        initial: Bytes,
    ) -> Result<RelayStats>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.metrics.relay_started();
        let active = ActiveRelay {
            engine: self,
            conn,
            lease,
        };
        debug!("Relaying {} over {}", conn, active.lease.channel());

        let mut encryptor = self.cipher.encryptor()?;
        let mut decryptor = self.cipher.decryptor()?;

        let (mut client_reader, mut client_writer) = tokio::io::split(client);
        let (mut upstream_reader, mut upstream_writer) = tokio::io::split(channel);

        let mut stats = RelayStats::default();

        let outcome = tokio::select! {
            r = pump(
                &mut client_reader,
                &mut upstream_writer,
                &mut *encryptor,
                &initial,
                self.buffer_size,
                &self.metrics,
                Direction::Upstream,
                &mut stats.bytes_upstream,
            ) => r,
            r = pump(
                &mut upstream_reader,
                &mut client_writer,
                &mut *decryptor,
                &[],
                self.buffer_size,
                &self.metrics,
                Direction::Downstream,
                &mut stats.bytes_downstream,
            ) => r,
        };

        let _ = client_writer.shutdown().await;
        let _ = upstream_writer.shutdown().await;
        drop(active);

        debug!(
            "Relay for {} finished: {} bytes up, {} bytes down",
            conn, stats.bytes_upstream, stats.bytes_downstream
        );
        outcome.map(|()| stats)
    }
}

/// Copy one direction: read, transform, write everything, repeat
///
/// `write_all` completing before the next read is what carries backpressure
/// from the destination back to the source.
#[allow(clippy::too_many_arguments)]
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    transform: &mut dyn StreamTransform,
    initial: &[u8],
    buffer_size: usize,
    metrics: &RelayMetrics,
    direction: Direction,
    total: &mut u64,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let leg_error = |e: ProxyError| ProxyError::Relay(format!("{} leg: {}", direction.label(), e));

    let mut buffer = vec![0u8; buffer_size];
    let mut out = BytesMut::with_capacity(buffer_size + IV_LEN);

    if !initial.is_empty() {
        forward(writer, transform, initial, &mut out, metrics, direction, total)
            .await
            .map_err(leg_error)?;
    }

    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| leg_error(e.into()))?;
        if n == 0 {
            debug!("{} leg reached end of stream", direction.label());
            return Ok(());
        }
        forward(writer, transform, &buffer[..n], &mut out, metrics, direction, total)
            .await
            .map_err(leg_error)?;
    }
}

async fn forward<W>(
    writer: &mut W,
    transform: &mut dyn StreamTransform,
    input: &[u8],
    out: &mut BytesMut,
    metrics: &RelayMetrics,
    direction: Direction,
    total: &mut u64,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.clear();
    transform.apply(input, out)?;
    if !out.is_empty() {
        writer.write_all(&out[..]).await?;
    }

    // Count plaintext: what the client sent, or what it was sent
    let plaintext = match direction {
        Direction::Upstream => input.len(),
        Direction::Downstream => out.len(),
    } as u64;
    *total += plaintext;
    metrics.add_bytes(direction, plaintext);
    Ok(())
}
