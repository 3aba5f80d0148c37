//! Relay metrics
//!
//! Counters live in atomics so the local status page can render them without
//! an exporter. Every record call is mirrored to the `metrics` facade for
//! whichever recorder the embedding process installs.
//!
//! # Metric names
//!
//! - `cipher_relay_connections_accepted_total`, `cipher_relay_connections_active`
//! - `cipher_relay_requests_total{type="tunnel"|"web"|"socks5"}`
//! - `cipher_relay_status_requests_total`
//! - `cipher_relay_decode_errors_total`
//! - `cipher_relay_upstream_connect_failures_total`
//! - `cipher_relay_relays_active`, `cipher_relay_channels_released_total`
//! - `cipher_relay_bytes_total{direction="upstream"|"downstream"}`

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge};

/// Relaxed is sufficient for independent counters
const METRIC_ORDERING: Ordering = Ordering::Relaxed;

/// Which front-end produced a relay request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    HttpTunnel,
    HttpWeb,
    Socks5,
}

impl RequestKind {
    fn label(&self) -> &'static str {
        match self {
            RequestKind::HttpTunnel => "tunnel",
            RequestKind::HttpWeb => "web",
            RequestKind::Socks5 => "socks5",
        }
    }
}

/// Direction of relayed bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to relay peer (plaintext bytes read from the client)
    Upstream,
    /// Relay peer to client (plaintext bytes written to the client)
    Downstream,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

#[derive(Debug)]
pub struct RelayMetrics {
    start_time: Instant,
    connections_accepted: AtomicU64,
    connections_active: AtomicU64,
    tunnel_requests: AtomicU64,
    web_requests: AtomicU64,
    socks5_requests: AtomicU64,
    status_requests: AtomicU64,
    decode_errors: AtomicU64,
    upstream_connect_failures: AtomicU64,
    relays_active: AtomicU64,
    channels_released: AtomicU64,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            tunnel_requests: AtomicU64::new(0),
            web_requests: AtomicU64::new(0),
            socks5_requests: AtomicU64::new(0),
            status_requests: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            upstream_connect_failures: AtomicU64::new(0),
            relays_active: AtomicU64::new(0),
            channels_released: AtomicU64::new(0),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
        }
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, METRIC_ORDERING);
        let active = self.connections_active.fetch_add(1, METRIC_ORDERING) + 1;
        counter!("cipher_relay_connections_accepted_total").increment(1);
        gauge!("cipher_relay_connections_active").set(active as f64);
    }

    pub fn connection_closed(&self) {
        let active = self.connections_active.fetch_sub(1, METRIC_ORDERING).saturating_sub(1);
        gauge!("cipher_relay_connections_active").set(active as f64);
    }

    pub fn request(&self, kind: RequestKind) {
        let slot = match kind {
            RequestKind::HttpTunnel => &self.tunnel_requests,
            RequestKind::HttpWeb => &self.web_requests,
            RequestKind::Socks5 => &self.socks5_requests,
        };
        slot.fetch_add(1, METRIC_ORDERING);
        counter!("cipher_relay_requests_total", "type" => kind.label()).increment(1);
    }

    pub fn status_request(&self) {
        self.status_requests.fetch_add(1, METRIC_ORDERING);
        counter!("cipher_relay_status_requests_total").increment(1);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, METRIC_ORDERING);
        counter!("cipher_relay_decode_errors_total").increment(1);
    }

    pub fn upstream_connect_failed(&self) {
        self.upstream_connect_failures.fetch_add(1, METRIC_ORDERING);
        counter!("cipher_relay_upstream_connect_failures_total").increment(1);
    }

    pub fn relay_started(&self) {
        let active = self.relays_active.fetch_add(1, METRIC_ORDERING) + 1;
        gauge!("cipher_relay_relays_active").set(active as f64);
    }

    pub fn relay_finished(&self) {
        let active = self.relays_active.fetch_sub(1, METRIC_ORDERING).saturating_sub(1);
        gauge!("cipher_relay_relays_active").set(active as f64);
    }

    pub fn channel_released(&self) {
        self.channels_released.fetch_add(1, METRIC_ORDERING);
        counter!("cipher_relay_channels_released_total").increment(1);
    }

    pub fn add_bytes(&self, direction: Direction, bytes: u64) {
        let slot = match direction {
            Direction::Upstream => &self.bytes_upstream,
            Direction::Downstream => &self.bytes_downstream,
        };
        slot.fetch_add(bytes, METRIC_ORDERING);
        counter!("cipher_relay_bytes_total", "direction" => direction.label()).increment(bytes);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(METRIC_ORDERING)
    }

    pub fn relays_active(&self) -> u64 {
        self.relays_active.load(METRIC_ORDERING)
    }

    pub fn channels_released(&self) -> u64 {
        self.channels_released.load(METRIC_ORDERING)
    }

    pub fn bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Upstream => self.bytes_upstream.load(METRIC_ORDERING),
            Direction::Downstream => self.bytes_downstream.load(METRIC_ORDERING),
        }
    }

    /// Render all counters in the Prometheus text exposition format
    pub fn scrape(&self) -> String {
        let mut out = String::with_capacity(1024);

        let mut emit = |name: &str, kind: &str, value: u64| {
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
        };

        emit("cipher_relay_uptime_seconds", "gauge", self.start_time.elapsed().as_secs());
        emit("cipher_relay_connections_accepted_total", "counter", self.connections_accepted.load(METRIC_ORDERING));
        emit("cipher_relay_connections_active", "gauge", self.connections_active.load(METRIC_ORDERING));
        emit("cipher_relay_status_requests_total", "counter", self.status_requests.load(METRIC_ORDERING));
        emit("cipher_relay_decode_errors_total", "counter", self.decode_errors.load(METRIC_ORDERING));
        emit("cipher_relay_upstream_connect_failures_total", "counter", self.upstream_connect_failures.load(METRIC_ORDERING));
        emit("cipher_relay_relays_active", "gauge", self.relays_active.load(METRIC_ORDERING));
        emit("cipher_relay_channels_released_total", "counter", self.channels_released.load(METRIC_ORDERING));

        let _ = writeln!(out, "# TYPE cipher_relay_requests_total counter");
        for kind in [RequestKind::HttpTunnel, RequestKind::HttpWeb, RequestKind::Socks5] {
            let value = match kind {
                RequestKind::HttpTunnel => self.tunnel_requests.load(METRIC_ORDERING),
                RequestKind::HttpWeb => self.web_requests.load(METRIC_ORDERING),
                RequestKind::Socks5 => self.socks5_requests.load(METRIC_ORDERING),
            };
            let _ = writeln!(out, "cipher_relay_requests_total{{type=\"{}\"}} {}", kind.label(), value);
        }

        let _ = writeln!(out, "# TYPE cipher_relay_bytes_total counter");
        for direction in [Direction::Upstream, Direction::Downstream] {
            let _ = writeln!(
                out,
                "cipher_relay_bytes_total{{direction=\"{}\"}} {}",
                direction.label(),
                self.bytes(direction)
            );
        }

        out
    }
}
