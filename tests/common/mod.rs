//! Shared harness: a proxy service wired to an in-memory relay peer.
//!
//! The peer accepts every CONNECT except targets starting with `refused`,
//! echoes channel data back verbatim and reports what it saw. Echoing the
//! ciphertext means the client reads back its own plaintext, while the peer
//! decrypts its copy to show what would reach the destination.

#![allow(dead_code)]

use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use cipher_relay_local::config::RelayConfig;
use cipher_relay_local::crypto::{AesCrypto, CipherKind, StreamCipher, StreamTransform};
use cipher_relay_local::proxy::{ProxyContext, ProxyHandle, ProxyService, StandardProxyService};
use cipher_relay_local::registry::ConnectionRegistry;
use cipher_relay_local::relay::mux::{read_frame, Frame, FrameKind};
use cipher_relay_local::relay::{MuxRelayClient, RelayOp, RelayResponse, VirtualChannel};
use cipher_relay_local::stats::RelayMetrics;

pub const PASSWORD: &str = "integration-secret";

/// First channel id the peer hands out
pub const FIRST_CHANNEL: u64 = 42;

/// What the fake relay peer observed
pub struct PeerEvents {
    /// CONNECT targets, in arrival order
    pub targets: mpsc::UnboundedReceiver<String>,
    /// Decrypted upstream bytes per channel
    pub plaintext: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    /// Channels the client closed
    pub closed: mpsc::UnboundedReceiver<u64>,
}

pub struct TestProxy {
    pub handle: ProxyHandle,
    pub ctx: Arc<ProxyContext>,
    pub events: PeerEvents,
}

pub fn test_config() -> RelayConfig {
    RelayConfig {
        password: PASSWORD.to_string(),
        cipher: CipherKind::Aes256Ctr,
        connect_timeout: 2,
        head_timeout: 2,
        shutdown_timeout: 1,
        ..Default::default()
    }
}

/// Start the service on ephemeral loopback ports in front of a fake peer
pub async fn start_proxy() -> TestProxy {
    let config = test_config();
    let (link, peer) = tokio::io::duplex(256 * 1024);
    let events = spawn_peer(peer, AesCrypto::new(config.cipher, PASSWORD));

    let client = MuxRelayClient::from_stream(link, config.channel_buffer, config.buffer_size);
    let ctx = Arc::new(ProxyContext::new(
        Arc::new(config.clone()),
        Arc::new(client),
        Arc::new(AesCrypto::new(config.cipher, &config.password)),
        RelayMetrics::shared(),
        Arc::new(ConnectionRegistry::new()),
    ));

    let loopback = "127.0.0.1:0".parse().unwrap();
    let handle = StandardProxyService::with_listeners(ctx.clone(), loopback, loopback)
        .start()
        .expect("service should bind ephemeral ports");

    TestProxy { handle, ctx, events }
}

fn spawn_peer(stream: tokio::io::DuplexStream, cipher: AesCrypto) -> PeerEvents {
    let (targets_tx, targets) = mpsc::unbounded_channel();
    let (plaintext_tx, plaintext) = mpsc::unbounded_channel();
    let (closed_tx, closed) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut next_channel = FIRST_CHANNEL;
        let mut decryptors: HashMap<u64, Box<dyn StreamTransform>> = HashMap::new();

        while let Ok(Some(frame)) = read_frame(&mut reader).await {
            let reply = match frame.kind {
                FrameKind::Request => {
                    let (op, body) = frame.as_request().unwrap();
                    assert_eq!(op, RelayOp::Connect);
                    let target = String::from_utf8(body.to_vec()).unwrap();
                    let response = if target.starts_with("refused") {
                        RelayResponse::error("connection refused")
                    } else {
                        let channel = next_channel;
                        next_channel += 1;
                        decryptors.insert(channel, cipher.decryptor().unwrap());
                        RelayResponse::connected(VirtualChannel::new(channel))
                    };
                    let _ = targets_tx.send(target);
                    Some(Frame::response(frame.id, &response))
                }
                FrameKind::Data => {
                    if let Some(decryptor) = decryptors.get_mut(&frame.id) {
                        let mut out = BytesMut::new();
                        decryptor.apply(&frame.payload, &mut out).unwrap();
                        if !out.is_empty() {
                            let _ = plaintext_tx.send((frame.id, out.to_vec()));
                        }
                    }
                    Some(Frame::data(VirtualChannel::new(frame.id), frame.payload.clone()))
                }
                FrameKind::Close => {
                    decryptors.remove(&frame.id);
                    let _ = closed_tx.send(frame.id);
                    None
                }
                FrameKind::Response => None,
            };

            if let Some(reply) = reply {
                if writer.write_all(&reply.encode()).await.is_err() {
                    break;
                }
            }
        }
    });

    PeerEvents {
        targets,
        plaintext,
        closed,
    }
}

/// Receive with a deadline so a broken test fails instead of hanging
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for peer event")
        .expect("peer stopped")
}

/// Collect decrypted bytes for `channel` until `expected` bytes arrived
pub async fn upstream_plaintext(events: &mut PeerEvents, channel: u64, expected: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    while collected.len() < expected {
        let (id, chunk) = recv(&mut events.plaintext).await;
        assert_eq!(id, channel);
        collected.extend_from_slice(&chunk);
    }
    collected
}

/// Poll until `check` holds or the deadline passes
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
