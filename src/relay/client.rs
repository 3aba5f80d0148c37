//! Relay-client seam
//!
//! The upstream link is a request/response exchange plus virtual
//! sub-channels. A CONNECT request carries `host:port`; a successful reply
//! carries the 8-byte big-endian id of the sub-channel the peer opened for it.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::common::{ProxyError, Result};

/// Identifier of a multiplexed sub-stream on the upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualChannel(u64);

impl VirtualChannel {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VirtualChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vc-{}", self.0)
    }
}

/// Byte stream of an open sub-channel
pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ChannelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedChannelIo = Box<dyn ChannelIo>;

/// Request operation codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOp {
    Connect = 0x01,
}

impl RelayOp {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Connect),
            _ => Err(ProxyError::ProtocolDecode(format!("unknown relay op: {:#04x}", v))),
        }
    }
}

/// Response status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok = 0x00,
    Error = 0x01,
}

impl ResponseStatus {
    pub fn from_u8(v: u8) -> Self {
        if v == 0x00 {
            Self::Ok
        } else {
            Self::Error
        }
    }
}

/// Reply to a relay request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayResponse {
    pub status: ResponseStatus,
    pub body: Bytes,
}

impl RelayResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            body: body.into(),
        }
    }

    pub fn error(reason: impl Into<Bytes>) -> Self {
        Self {
            status: ResponseStatus::Error,
            body: reason.into(),
        }
    }

    /// Successful CONNECT reply for `channel`
    pub fn connected(channel: VirtualChannel) -> Self {
        Self::ok(Bytes::copy_from_slice(&channel.id().to_be_bytes()))
    }

    pub fn is_successful(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Read the channel id out of a CONNECT reply body
    pub fn virtual_channel(&self) -> Result<VirtualChannel> {
        let bytes: [u8; 8] = self.body.as_ref().try_into().map_err(|_| {
            ProxyError::UpstreamConnect(format!(
                "CONNECT reply body must be 8 bytes, got {}",
                self.body.len()
            ))
        })?;
        Ok(VirtualChannel(u64::from_be_bytes(bytes)))
    }
}

/// Client half of the multiplexed upstream link
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Issue a request and wait for its response
    async fn send(&self, op: RelayOp, body: Bytes) -> Result<RelayResponse>;

    /// Attach to the byte stream of a channel the peer opened
    fn open_channel(&self, channel: VirtualChannel) -> Result<BoxedChannelIo>;

    /// Tell the peer the channel is finished
    fn release_channel(&self, channel: VirtualChannel);
}

/// Ask the relay peer to connect to `target`
///
/// # Errors
///
/// Every failure is reported as `ProxyError::UpstreamConnect`: transport
/// errors, a non-success status, a malformed reply, or no reply within
/// `connect_timeout`.
pub async fn connect_upstream(
    client: &dyn RelayClient,
    target: &str,
    connect_timeout: Duration,
) -> Result<VirtualChannel> {
    let body = Bytes::copy_from_slice(target.as_bytes());

    let response = match timeout(connect_timeout, client.send(RelayOp::Connect, body)).await {
        Ok(Ok(response)) => response,
        Ok(Err(ProxyError::UpstreamConnect(reason))) => return Err(ProxyError::UpstreamConnect(reason)),
        Ok(Err(e)) => return Err(ProxyError::UpstreamConnect(format!("{}: {}", target, e))),
        Err(_) => {
            return Err(ProxyError::UpstreamConnect(format!(
                "{}: no reply within {:?}",
                target, connect_timeout
            )))
        }
    };

    if !response.is_successful() {
        return Err(ProxyError::UpstreamConnect(format!(
            "{}: refused by relay: {}",
            target,
            String::from_utf8_lossy(&response.body)
        )));
    }

    let channel = response.virtual_channel()?;
    debug!("Connected to {}, id: {}", target, channel);
    Ok(channel)
}

/// Ownership of an open sub-channel
///
/// The channel is released exactly once: on the first `release` call or on
/// drop, whichever comes first.
pub struct ChannelLease {
    client: Arc<dyn RelayClient>,
    channel: VirtualChannel,
    released: AtomicBool,
}

impl ChannelLease {
    pub fn new(client: Arc<dyn RelayClient>, channel: VirtualChannel) -> Self {
        Self {
            client,
            channel,
            released: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> VirtualChannel {
        self.channel
    }

    /// Release the channel; returns `false` if it was already released
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("Releasing {}", self.channel);
        self.client.release_channel(self.channel);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("channel", &self.channel)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.release() {
            warn!("{} released on drop", self.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_channel_from_reply() {
        let response = RelayResponse::connected(VirtualChannel::new(42));
        assert_eq!(&response.body[..], &[0, 0, 0, 0, 0, 0, 0, 42]);
        assert_eq!(response.virtual_channel().unwrap(), VirtualChannel::new(42));

        let short = RelayResponse::ok(Bytes::from_static(b"\x01\x02"));
        assert!(matches!(short.virtual_channel(), Err(ProxyError::UpstreamConnect(_))));
    }

    #[tokio::test]
    async fn test_connect_upstream_sends_target() {
        let mut client = MockRelayClient::new();
        client
            .expect_send()
            .withf(|op, body| *op == RelayOp::Connect && &body[..] == b"example.com:443")
            .times(1)
            .returning(|_, _| Ok(RelayResponse::connected(VirtualChannel::new(7))));

        let channel = connect_upstream(&client, "example.com:443", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(channel.id(), 7);
    }

    #[tokio::test]
    async fn test_connect_upstream_refused() {
        let mut client = MockRelayClient::new();
        client
            .expect_send()
            .returning(|_, _| Ok(RelayResponse::error(Bytes::from_static(b"connection refused"))));

        match connect_upstream(&client, "example.com:443", Duration::from_secs(1)).await {
            Err(ProxyError::UpstreamConnect(reason)) => assert!(reason.contains("connection refused")),
            other => panic!("expected upstream connect error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_upstream_transport_error() {
        let mut client = MockRelayClient::new();
        client
            .expect_send()
            .returning(|_, _| Err(ProxyError::Relay("link closed".to_string())));

        assert!(matches!(
            connect_upstream(&client, "a:1", Duration::from_secs(1)).await,
            Err(ProxyError::UpstreamConnect(_))
        ));
    }

    #[test]
    fn test_lease_releases_once() {
        let mut client = MockRelayClient::new();
        client
            .expect_release_channel()
            .withf(|channel| channel.id() == 9)
            .times(1)
            .return_const(());

        let lease = ChannelLease::new(Arc::new(client), VirtualChannel::new(9));
        assert!(lease.release());
        assert!(!lease.release());
        drop(lease);
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let mut client = MockRelayClient::new();
        client.expect_release_channel().times(1).return_const(());

        let lease = ChannelLease::new(Arc::new(client), VirtualChannel::new(3));
        drop(lease);
    }
}
