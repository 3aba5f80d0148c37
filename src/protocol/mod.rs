//! Front-end protocol decoding
//!
//! Both decoders are pure with respect to connection state: they read bytes
//! and return typed results, leaving session bookkeeping to the handlers in
//! `proxy`.

pub mod http_head;
pub mod socks5;

pub use http_head::{decode_request_head, HeadDecode, LocalRequest, ProxyRequestHead};
pub use socks5::{Socks5Address, Socks5CommandRequest, Socks5CommandResponse, Socks5Status};
