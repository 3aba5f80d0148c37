//! Multiplexed relay link over a single TCP connection.
//!
//! Each frame has a 13-byte header: kind(1) + id(8) + payload_len(4) + payload.
//!
//! - `Request`: id is the request id, payload is op(1) + body.
//! - `Response`: id is the request id, payload is status(1) + body.
//! - `Data`: id is the virtual channel, payload is opaque channel bytes.
//! - `Close`: id is the virtual channel, no payload.
//!
//! A writer task drains a bounded frame queue onto the link. A reader task
//! resolves pending requests and routes channel data into bounded
//! per-channel queues. A channel whose queue is full is reset; the shared
//! link never waits on a single channel.
//!
//! Close for an opened channel is sent by its bridge once the local end has
//! been closed and every outbound byte is queued, so it never overtakes data.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::client::{
    BoxedChannelIo, RelayClient, RelayOp, RelayResponse, ResponseStatus, VirtualChannel,
};
use crate::common::{ProxyError, Result};

/// Frame header size
pub const FRAME_HEADER_SIZE: usize = 13;

/// Maximum payload size per frame
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Link frame kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request = 0x01,
    Response = 0x02,
    Data = 0x03,
    Close = 0x04,
}

impl FrameKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::Close),
            _ => Err(ProxyError::Relay(format!("unknown frame kind: {:#04x}", v))),
        }
    }
}

/// A link frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(id: u64, op: RelayOp, body: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(1 + body.len());
        payload.put_u8(op as u8);
        payload.put_slice(body);
        Self {
            kind: FrameKind::Request,
            id,
            payload: payload.freeze(),
        }
    }

    pub fn response(id: u64, response: &RelayResponse) -> Self {
        let mut payload = BytesMut::with_capacity(1 + response.body.len());
        payload.put_u8(response.status as u8);
        payload.put_slice(&response.body);
        Self {
            kind: FrameKind::Response,
            id,
            payload: payload.freeze(),
        }
    }

    pub fn data(channel: VirtualChannel, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Data,
            id: channel.id(),
            payload,
        }
    }

    pub fn close(channel: VirtualChannel) -> Self {
        Self {
            kind: FrameKind::Close,
            id: channel.id(),
            payload: Bytes::new(),
        }
    }

    /// Encode the frame into bytes for transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u64(self.id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Split a `Request` payload into op and body
    pub fn as_request(&self) -> Result<(RelayOp, Bytes)> {
        let op = *self
            .payload
            .first()
            .ok_or_else(|| ProxyError::Relay("empty request frame".to_string()))?;
        Ok((RelayOp::from_u8(op)?, self.payload.slice(1..)))
    }

    /// Split a `Response` payload into status and body
    pub fn as_response(&self) -> Result<RelayResponse> {
        let status = *self
            .payload
            .first()
            .ok_or_else(|| ProxyError::Relay("empty response frame".to_string()))?;
        Ok(RelayResponse {
            status: ResponseStatus::from_u8(status),
            body: self.payload.slice(1..),
        })
    }
}

/// Read one frame; `None` on a clean end of stream between frames
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let kind = FrameKind::from_u8(header[0])?;
    let id = u64::from_be_bytes([
        header[1], header[2], header[3], header[4], header[5], header[6], header[7], header[8],
    ]);
    let len = u32::from_be_bytes([header[9], header[10], header[11], header[12]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(ProxyError::Relay(format!("frame too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame {
        kind,
        id,
        payload: Bytes::from(payload),
    }))
}

/// Per-channel inbound queue; `rx` is handed out once by `open_channel`
struct ChannelSlot {
    tx: mpsc::Sender<Bytes>,
    rx: Option<mpsc::Receiver<Bytes>>,
    /// Set once a Close has been sent or received for the channel
    closed: Arc<AtomicBool>,
}

impl ChannelSlot {
    fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            tx,
            rx: Some(rx),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct PendingRequest {
    op: RelayOp,
    reply: oneshot::Sender<RelayResponse>,
}

struct Shared {
    frame_tx: mpsc::Sender<Frame>,
    pending: DashMap<u64, PendingRequest>,
    channels: DashMap<u64, ChannelSlot>,
    next_request: AtomicU64,
    closed: AtomicBool,
    channel_buffer: usize,
    buffer_size: usize,
}

impl Shared {
    fn queue_close(&self, channel: VirtualChannel) {
        match self.frame_tx.try_send(Frame::close(channel)) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                // Queue is saturated; hand the frame to a task instead of blocking the caller
                if let Ok(handle) = Handle::try_current() {
                    let tx = self.frame_tx.clone();
                    handle.spawn(async move {
                        let _ = tx.send(frame).await;
                    });
                }
            }
            Err(TrySendError::Closed(_)) => trace!("Link closed, dropping close for {}", channel),
        }
    }

    /// Forget a channel and send Close unless one already went out
    fn reset_channel(&self, channel: VirtualChannel) {
        if let Some((_, slot)) = self.channels.remove(&channel.id()) {
            if !slot.closed.swap(true, Ordering::AcqRel) {
                self.queue_close(channel);
            }
        }
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.clear();
        self.channels.clear();
    }
}

/// Removes a pending request if the caller stops waiting for it
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.id);
    }
}

/// `RelayClient` speaking the frame protocol over one stream
pub struct MuxRelayClient {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl MuxRelayClient {
    /// Connect to a relay server
    pub async fn connect(addr: &str, channel_buffer: usize, buffer_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            ProxyError::UpstreamConnect(format!("failed to connect to relay server {}: {}", addr, e))
        })?;
        stream.set_nodelay(true)?;
        info!("Connected to relay server {}", addr);
        Ok(Self::from_stream(stream, channel_buffer, buffer_size))
    }

    /// Run the link over an already established stream
    pub fn from_stream<S>(stream: S, channel_buffer: usize, buffer_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let channel_buffer = channel_buffer.max(1);
        let (read_half, write_half) = tokio::io::split(stream);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(channel_buffer);

        let shared = Arc::new(Shared {
            frame_tx,
            pending: DashMap::new(),
            channels: DashMap::new(),
            next_request: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            channel_buffer,
            buffer_size: buffer_size.clamp(1, MAX_FRAME_PAYLOAD),
        });

        let writer = tokio::spawn(link_writer(write_half, frame_rx));
        let reader = tokio::spawn(link_reader(read_half, shared.clone()));

        Self {
            shared,
            reader,
            writer,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn closed_error() -> ProxyError {
        ProxyError::UpstreamConnect("relay link closed".to_string())
    }
}

impl Drop for MuxRelayClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl RelayClient for MuxRelayClient {
    async fn send(&self, op: RelayOp, body: Bytes) -> Result<RelayResponse> {
        if self.is_closed() {
            return Err(Self::closed_error());
        }
        if body.len() + 1 > MAX_FRAME_PAYLOAD {
            return Err(ProxyError::Relay(format!("request body too large: {} bytes", body.len())));
        }

        let id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.shared.pending.insert(id, PendingRequest { op, reply });
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };
        // The reader may have cleared `pending` between the check above and the insert
        if self.is_closed() {
            return Err(Self::closed_error());
        }

        trace!("Sending request {} ({:?}, {} bytes)", id, op, body.len());
        self.shared
            .frame_tx
            .send(Frame::request(id, op, &body))
            .await
            .map_err(|_| Self::closed_error())?;

        rx.await.map_err(|_| Self::closed_error())
    }

    fn open_channel(&self, channel: VirtualChannel) -> Result<BoxedChannelIo> {
        let (rx, closed) = self
            .shared
            .channels
            .get_mut(&channel.id())
            .and_then(|mut slot| slot.rx.take().map(|rx| (rx, slot.closed.clone())))
            .ok_or_else(|| ProxyError::Relay(format!("{} is not open on the relay link", channel)))?;

        let (local, remote) = tokio::io::duplex(self.shared.buffer_size);
        tokio::spawn(bridge_channel(
            channel,
            remote,
            rx,
            self.shared.frame_tx.clone(),
            closed,
            self.shared.buffer_size,
        ));
        Ok(Box::new(local))
    }

    fn release_channel(&self, channel: VirtualChannel) {
        let slot = match self.shared.channels.remove(&channel.id()) {
            Some((_, slot)) => slot,
            None => return,
        };
        // An opened channel is closed by its bridge after the outbound bytes
        if slot.rx.is_some() && !slot.closed.swap(true, Ordering::AcqRel) && !self.is_closed() {
            self.shared.queue_close(channel);
        }
    }
}

async fn link_writer<W>(mut writer: WriteHalf<W>, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame.encode()).await {
            warn!("Relay link write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("Relay link writer stopped");
}

async fn link_reader<R>(mut reader: ReadHalf<R>, shared: Arc<Shared>)
where
    R: AsyncRead,
{
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Relay link closed by peer");
                break;
            }
            Err(e) => {
                warn!("Relay link read failed: {}", e);
                break;
            }
        };

        match frame.kind {
            FrameKind::Response => handle_response(&shared, frame),
            FrameKind::Data => {
                let tx = shared.channels.get(&frame.id).map(|slot| slot.tx.clone());
                match tx {
                    Some(tx) => match tx.try_send(frame.payload) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("vc-{} is not draining its inbound queue, resetting it", frame.id);
                            shared.reset_channel(VirtualChannel::new(frame.id));
                        }
                        Err(TrySendError::Closed(_)) => {
                            shared.channels.remove(&frame.id);
                        }
                    },
                    None => trace!("Dropping data for unknown channel {}", frame.id),
                }
            }
            FrameKind::Close => {
                debug!("Peer closed vc-{}", frame.id);
                if let Some((_, slot)) = shared.channels.remove(&frame.id) {
                    slot.closed.store(true, Ordering::Release);
                }
            }
            FrameKind::Request => warn!("Ignoring request frame {} from relay peer", frame.id),
        }
    }

    shared.mark_closed();
}

fn handle_response(shared: &Shared, frame: Frame) {
    let (_, pending) = match shared.pending.remove(&frame.id) {
        Some(entry) => entry,
        None => {
            debug!("Response for unknown request {}", frame.id);
            // The requester timed out; a channel opened for it has no owner
            if let Some(channel) = orphaned_channel(&frame) {
                debug!("Closing orphaned {}", channel);
                shared.queue_close(channel);
            }
            return;
        }
    };

    let response = match frame.as_response() {
        Ok(response) => response,
        Err(e) => {
            warn!("Malformed response to request {}: {}", frame.id, e);
            return;
        }
    };

    let mut opened = None;
    if pending.op == RelayOp::Connect && response.is_successful() {
        if let Ok(channel) = response.virtual_channel() {
            // The slot must exist before the first data frame for the channel arrives
            shared.channels.insert(channel.id(), ChannelSlot::new(shared.channel_buffer));
            opened = Some(channel);
        }
    }

    if pending.reply.send(response).is_err() {
        if let Some(channel) = opened {
            debug!("Requester gone, closing {}", channel);
            shared.reset_channel(channel);
        }
    }
}

/// Channel carried by a successful CONNECT reply nobody is waiting for
fn orphaned_channel(frame: &Frame) -> Option<VirtualChannel> {
    let response = frame.as_response().ok()?;
    if !response.is_successful() {
        return None;
    }
    response.virtual_channel().ok()
}

/// Pump bytes between the in-memory end of a channel and the link
async fn bridge_channel(
    channel: VirtualChannel,
    remote: tokio::io::DuplexStream,
    mut inbound: mpsc::Receiver<Bytes>,
    frame_tx: mpsc::Sender<Frame>,
    closed: Arc<AtomicBool>,
    buffer_size: usize,
) {
    let (mut remote_reader, mut remote_writer) = tokio::io::split(remote);

    let to_local = async move {
        while let Some(chunk) = inbound.recv().await {
            if remote_writer.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = remote_writer.shutdown().await;
    };

    let to_link = async move {
        let mut buffer = vec![0u8; buffer_size];
        loop {
            match remote_reader.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = Frame::data(channel, Bytes::copy_from_slice(&buffer[..n]));
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
        if !closed.swap(true, Ordering::AcqRel) {
            let _ = frame_tx.send(Frame::close(channel)).await;
        }
    };

    tokio::join!(to_local, to_link);
    trace!("Bridge for {} stopped", channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::client::connect_upstream;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_frame<R: AsyncRead + Unpin>(peer: &mut R) -> Frame {
        timeout(Duration::from_secs(5), read_frame(peer))
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .expect("link closed")
    }

    #[test]
    fn test_frame_encoding_layout() {
        let frame = Frame::request(5, RelayOp::Connect, b"host:80");
        let bytes = frame.encode();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..9], &5u64.to_be_bytes());
        assert_eq!(&bytes[9..13], &8u32.to_be_bytes());
        assert_eq!(bytes[13], RelayOp::Connect as u8);
        assert_eq!(&bytes[14..], b"host:80");
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_payload() {
        let mut header = vec![FrameKind::Data as u8];
        header.extend_from_slice(&1u64.to_be_bytes());
        header.extend_from_slice(&((MAX_FRAME_PAYLOAD as u32) + 1).to_be_bytes());
        assert!(read_frame(&mut header.as_slice()).await.is_err());

        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_connect_and_channel_traffic() {
        let (link, mut peer) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(MuxRelayClient::from_stream(link, 8, 1024));

        let requester = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send(RelayOp::Connect, Bytes::from_static(b"example.com:443"))
                    .await
            })
        };

        let request = next_frame(&mut peer).await;
        assert_eq!(request.kind, FrameKind::Request);
        let (op, body) = request.as_request().unwrap();
        assert_eq!(op, RelayOp::Connect);
        assert_eq!(&body[..], b"example.com:443");

        let channel = VirtualChannel::new(42);
        peer.write_all(&Frame::response(request.id, &RelayResponse::connected(channel)).encode())
            .await
            .unwrap();
        // Data may arrive before the channel is opened locally
        peer.write_all(&Frame::data(channel, Bytes::from_static(b"early")).encode())
            .await
            .unwrap();

        let response = requester.await.unwrap().unwrap();
        assert_eq!(response.virtual_channel().unwrap(), channel);

        let mut io = client.open_channel(channel).unwrap();
        let mut buf = [0u8; 5];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        io.write_all(b"outbound").await.unwrap();
        let data = next_frame(&mut peer).await;
        assert_eq!(data.kind, FrameKind::Data);
        assert_eq!(data.id, 42);
        assert_eq!(&data.payload[..], b"outbound");

        assert!(client.open_channel(channel).is_err());

        drop(io);
        client.release_channel(channel);
        let close = next_frame(&mut peer).await;
        assert_eq!(close, Frame::close(channel));
    }

    /// Open `channel` on the client via a CONNECT answered by the peer
    async fn open<R, W>(client: &Arc<MuxRelayClient>, reader: &mut R, writer: &mut W, channel: VirtualChannel) -> BoxedChannelIo
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let requester = {
            let client = client.clone();
            tokio::spawn(async move { client.send(RelayOp::Connect, Bytes::from_static(b"a:1")).await })
        };
        let request = next_frame(reader).await;
        writer
            .write_all(&Frame::response(request.id, &RelayResponse::connected(channel)).encode())
            .await
            .unwrap();
        requester.await.unwrap().unwrap();
        client.open_channel(channel).unwrap()
    }

    #[tokio::test]
    async fn test_close_follows_last_outbound_bytes() {
        let (link, peer) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(MuxRelayClient::from_stream(link, 8, 1024));
        let (mut peer_reader, mut peer_writer) = tokio::io::split(peer);
        let channel = VirtualChannel::new(3);

        let mut io = open(&client, &mut peer_reader, &mut peer_writer, channel).await;

        // Write, close and release straight away, the way the engine tears down
        io.write_all(b"last words").await.unwrap();
        io.shutdown().await.unwrap();
        client.release_channel(channel);
        drop(io);

        let data = next_frame(&mut peer_reader).await;
        assert_eq!(data, Frame::data(channel, Bytes::from_static(b"last words")));
        assert_eq!(next_frame(&mut peer_reader).await, Frame::close(channel));

        // Exactly one Close
        assert!(timeout(Duration::from_millis(100), read_frame(&mut peer_reader)).await.is_err());
    }

    #[tokio::test]
    async fn test_late_reply_after_timeout_closes_channel() {
        let (link, mut peer) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(MuxRelayClient::from_stream(link, 8, 1024));

        let result = connect_upstream(&*client, "a:1", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProxyError::UpstreamConnect(_))));

        let request = next_frame(&mut peer).await;
        let channel = VirtualChannel::new(5);
        peer.write_all(&Frame::response(request.id, &RelayResponse::connected(channel)).encode())
            .await
            .unwrap();

        assert_eq!(next_frame(&mut peer).await, Frame::close(channel));
        assert!(client.open_channel(channel).is_err());
    }

    #[tokio::test]
    async fn test_stalled_channel_is_reset_without_blocking_link() {
        let (link, peer) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(MuxRelayClient::from_stream(link, 8, 1024));
        let (mut peer_reader, mut peer_writer) = tokio::io::split(peer);
        let stalled = VirtualChannel::new(1);

        // Opened but never read
        let _io = open(&client, &mut peer_reader, &mut peer_writer, stalled).await;

        let chunk = Bytes::from(vec![0u8; 1024]);
        timeout(Duration::from_secs(5), async {
            for _ in 0..200 {
                peer_writer
                    .write_all(&Frame::data(stalled, chunk.clone()).encode())
                    .await
                    .unwrap();
            }
        })
        .await
        .expect("link reader stalled behind one channel");

        assert_eq!(next_frame(&mut peer_reader).await, Frame::close(stalled));

        // Unrelated CONNECTs still complete promptly
        let other = VirtualChannel::new(2);
        let opened = timeout(
            Duration::from_secs(2),
            open(&client, &mut peer_reader, &mut peer_writer, other),
        )
        .await;
        assert!(opened.is_ok());
    }

    #[tokio::test]
    async fn test_peer_close_ends_channel_stream() {
        let (link, mut peer) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(MuxRelayClient::from_stream(link, 8, 1024));

        let requester = {
            let client = client.clone();
            tokio::spawn(async move { client.send(RelayOp::Connect, Bytes::from_static(b"a:1")).await })
        };
        let request = next_frame(&mut peer).await;
        let channel = VirtualChannel::new(7);
        peer.write_all(&Frame::response(request.id, &RelayResponse::connected(channel)).encode())
            .await
            .unwrap();
        requester.await.unwrap().unwrap();

        let mut io = client.open_channel(channel).unwrap();
        peer.write_all(&Frame::close(channel).encode()).await.unwrap();

        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), io.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_error_response_is_returned() {
        let (link, mut peer) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(MuxRelayClient::from_stream(link, 8, 1024));

        let requester = {
            let client = client.clone();
            tokio::spawn(async move { client.send(RelayOp::Connect, Bytes::from_static(b"a:1")).await })
        };
        let request = next_frame(&mut peer).await;
        peer.write_all(&Frame::response(request.id, &RelayResponse::error("refused")).encode())
            .await
            .unwrap();

        let response = requester.await.unwrap().unwrap();
        assert!(!response.is_successful());
        assert_eq!(&response.body[..], b"refused");
    }

    #[tokio::test]
    async fn test_link_loss_fails_requests() {
        let (link, mut peer) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(MuxRelayClient::from_stream(link, 8, 1024));

        let requester = {
            let client = client.clone();
            tokio::spawn(async move { client.send(RelayOp::Connect, Bytes::from_static(b"a:1")).await })
        };
        let _ = next_frame(&mut peer).await;
        drop(peer);

        assert!(matches!(
            requester.await.unwrap(),
            Err(ProxyError::UpstreamConnect(_))
        ));

        timeout(Duration::from_secs(5), async {
            while !client.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(
            client.send(RelayOp::Connect, Bytes::new()).await,
            Err(ProxyError::UpstreamConnect(_))
        ));
        // Requests on a dead link never linger in the pending table
        assert!(client.shared.pending.is_empty());
    }
}
