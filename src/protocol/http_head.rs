//! HTTP proxy request-head decoder
//!
//! Classifies the first request line of an HTTP-protocol connection:
//!
//! - `CONNECT host:port` opens a tunnel.
//! - Any other method with an absolute URI is a forward-proxy request; the
//!   buffered bytes are handed on untouched so the target sees the exact
//!   request the client sent.
//! - A relative request-target is addressed to this process and answered
//!   with the metrics page.

use bytes::Bytes;
use log::trace;
use url::{Host, Url};

use crate::common::{format_authority, ProxyError, Result};
use crate::registry::ProxyType;

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

/// Decoded proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequestHead {
    pub host: String,
    pub port: u16,
    pub proxy_type: ProxyType,
    pub version: String,
    /// Bytes to forward before relaying; the full request for `Web`, empty for `Tunnel`
    pub payload: Bytes,
}

impl ProxyRequestHead {
    /// Destination as `host:port`
    pub fn target(&self) -> String {
        format_authority(&self.host, self.port)
    }
}

/// Request addressed to the relay itself rather than proxied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRequest {
    pub method: String,
    pub path: String,
    pub version: String,
}

/// Outcome of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadDecode {
    /// No CRLF yet; read more before retrying
    Incomplete,
    /// Proxy request for the relay path
    Proxy(ProxyRequestHead),
    /// Relative request-target, served locally
    LocalStatus(LocalRequest),
}

/// RFC 7230 §3.5 whitespace accepted between request-line fields
fn is_http_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\u{0b}' | '\u{0c}' | '\r')
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Offset just past the blank line that ends a request head, if buffered
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    find(buf, HEAD_END).map(|idx| idx + HEAD_END.len())
}

/// Decode the request line at the start of `buf`
///
/// `buf` is never consumed: for forward-proxy requests the whole buffer is
/// copied into the returned payload.
///
/// # Errors
///
/// `ProxyError::ProtocolDecode` for an empty or non-UTF-8 request line, a
/// field count other than three, a CONNECT target that is not `host:port`,
/// or a request-target that is neither a relative reference nor an absolute
/// URI with a host.
pub fn decode_request_head(buf: &[u8]) -> Result<HeadDecode> {
    let idx = match find(buf, CRLF) {
        Some(idx) => idx,
        None => return Ok(HeadDecode::Incomplete),
    };
    if idx == 0 {
        return Err(ProxyError::ProtocolDecode("empty request line".to_string()));
    }

    let line = std::str::from_utf8(&buf[..idx])
        .map_err(|_| ProxyError::ProtocolDecode("request line is not valid UTF-8".to_string()))?;
    trace!("Request line: {}", line);

    let fields: Vec<&str> = line.split(is_http_whitespace).filter(|f| !f.is_empty()).collect();
    let (method, target, version) = match fields.as_slice() {
        [method, target, version] => (*method, *target, *version),
        _ => {
            return Err(ProxyError::ProtocolDecode(format!(
                "expected 3 request-line fields, got {}: {:?}",
                fields.len(),
                line
            )))
        }
    };

    if method == "CONNECT" {
        let (host, port) = parse_authority(target)?;
        return Ok(HeadDecode::Proxy(ProxyRequestHead {
            host,
            port,
            proxy_type: ProxyType::Tunnel,
            version: version.to_string(),
            payload: Bytes::new(),
        }));
    }

    match Url::parse(target) {
        Ok(url) => {
            let host = match url.host() {
                Some(Host::Domain(domain)) => domain.to_string(),
                Some(Host::Ipv4(addr)) => addr.to_string(),
                Some(Host::Ipv6(addr)) => addr.to_string(),
                None => {
                    return Err(ProxyError::ProtocolDecode(format!(
                        "absolute URI without host: {}",
                        target
                    )))
                }
            };
            let port = url.port_or_known_default().unwrap_or(80);

            Ok(HeadDecode::Proxy(ProxyRequestHead {
                host,
                port,
                proxy_type: ProxyType::Web,
                version: version.to_string(),
                payload: Bytes::copy_from_slice(buf),
            }))
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(HeadDecode::LocalStatus(LocalRequest {
            method: method.to_string(),
            path: target.to_string(),
            version: version.to_string(),
        })),
        Err(e) => Err(ProxyError::ProtocolDecode(format!(
            "invalid request-target {:?}: {}",
            target, e
        ))),
    }
}

/// Parse a CONNECT target of the form `host:port` or `[v6]:port`
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    let invalid = |why: &str| ProxyError::ProtocolDecode(format!("invalid authority {:?}: {}", authority, why));

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port"))?;
        (&rest[..end], port)
    } else {
        let (host, port) = authority.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("IPv6 literal must be bracketed"));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    let port: u16 = port.parse().map_err(|_| invalid("port is not a number in 1..=65535"))?;
    if port == 0 {
        return Err(invalid("port 0"));
    }

    Ok((host.to_string(), port))
}

/// Build the local status response around a `text/plain` body
///
/// `Content-Length` counts bytes, not characters.
pub fn status_page(body: &str) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}

/// Response to a successful CONNECT
pub fn connection_established(version: &str) -> Vec<u8> {
    format!("{} 200 Connection Established\r\n\r\n", version).into_bytes()
}

/// Response when the request head cannot be decoded
pub const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Response when the relay peer refuses or fails the CONNECT
pub const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
