//! Proxy service module
//!
//! Two front-ends share one `ProxyContext`: an HTTP forward proxy that also
//! answers local status requests, and a SOCKS5 server. Both hand accepted
//! connections to the relay engine once the upstream channel is open.
//!
//! The service is message-driven: `StandardProxyService::start` returns a
//! `ProxyHandle` used to snapshot and shut down the running accept loop.

pub mod context;
pub mod http;
mod message;
mod service;
pub mod socks;

pub use context::ProxyContext;
pub use http::serve_http;
pub use message::{ProxyHandle, ProxyMessage, ServiceStats};
pub use service::{ProxyService, StandardProxyService};
pub use socks::{serve_socks5, Socks5ConnectHandler};
