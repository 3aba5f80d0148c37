//! SOCKS5 handshake codec (RFC 1928)
//!
//! Only the no-authentication method is offered. The command request is
//! decoded into a `Socks5CommandRequest`; replies are encoded from a
//! `Socks5CommandResponse`.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{format_authority, ProxyError, Result};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Status {
    Success = 0x00,
    Failure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Destination address of a command request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl Socks5Address {
    pub fn addr_type(&self) -> u8 {
        match self {
            Socks5Address::Ipv4(_) => ATYP_IPV4,
            Socks5Address::Domain(_) => ATYP_DOMAIN,
            Socks5Address::Ipv6(_) => ATYP_IPV6,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Socks5Address::Ipv4(addr) => out.extend_from_slice(&addr.octets()),
            Socks5Address::Domain(domain) => {
                out.push(domain.len() as u8);
                out.extend_from_slice(domain.as_bytes());
            }
            Socks5Address::Ipv6(addr) => out.extend_from_slice(&addr.octets()),
        }
    }
}

impl fmt::Display for Socks5Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Socks5Address::Ipv4(addr) => write!(f, "{}", addr),
            Socks5Address::Domain(domain) => write!(f, "{}", domain),
            Socks5Address::Ipv6(addr) => write!(f, "{}", addr),
        }
    }
}

/// Decoded command request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5CommandRequest {
    pub command: u8,
    pub address: Socks5Address,
    pub port: u16,
}

impl Socks5CommandRequest {
    pub fn connect(address: Socks5Address, port: u16) -> Self {
        Self {
            command: CMD_CONNECT,
            address,
            port,
        }
    }

    /// Destination as `host:port`, the body of the upstream CONNECT
    pub fn target(&self) -> String {
        format_authority(&self.address.to_string(), self.port)
    }
}

/// Reply to a command request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5CommandResponse {
    pub status: Socks5Status,
    pub addr_type: u8,
    /// `None` encodes an all-zero address of `addr_type`
    pub address: Option<Socks5Address>,
    pub port: u16,
}

impl Socks5CommandResponse {
    /// Success reply echoing the requested destination
    pub fn success(request: &Socks5CommandRequest) -> Self {
        Self {
            status: Socks5Status::Success,
            addr_type: request.address.addr_type(),
            address: Some(request.address.clone()),
            port: request.port,
        }
    }

    /// Error reply carrying no address
    pub fn error(status: Socks5Status, addr_type: u8) -> Self {
        Self {
            status,
            addr_type,
            address: None,
            port: 0,
        }
    }

    pub fn failure(addr_type: u8) -> Self {
        Self::error(Socks5Status::Failure, addr_type)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(22);
        out.extend_from_slice(&[SOCKS5_VERSION, self.status as u8, 0x00, self.addr_type]);
        match &self.address {
            Some(address) => address.encode_into(&mut out),
            None => match self.addr_type {
                ATYP_DOMAIN => out.push(0),
                ATYP_IPV6 => out.extend_from_slice(&[0u8; 16]),
                _ => out.extend_from_slice(&[0u8; 4]),
            },
        }
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }
}

/// Run the method negotiation, selecting no-authentication
///
/// # Errors
///
/// Fails with `ProtocolDecode` on a non-SOCKS5 greeting, or when the client
/// does not offer no-authentication (after telling it so).
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::ProtocolDecode(format!(
            "unsupported SOCKS version: {:#04x}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(ProxyError::ProtocolDecode(format!(
            "client offered no acceptable auth method: {:02x?}",
            methods
        )));
    }

    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;
    Ok(())
}

/// Read one command request
///
/// The command byte is returned as-is; callers decide what they support.
/// An unknown address type is answered with `AddressTypeNotSupported`.
pub async fn read_command_request<S>(stream: &mut S) -> Result<Socks5CommandRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::ProtocolDecode(format!(
            "unsupported SOCKS version in request: {:#04x}",
            header[0]
        )));
    }

    let address = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Socks5Address::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| ProxyError::ProtocolDecode("domain is not valid UTF-8".to_string()))?;
            if domain.is_empty() {
                return Err(ProxyError::ProtocolDecode("empty domain".to_string()));
            }
            Socks5Address::Domain(domain)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Socks5Address::Ipv6(Ipv6Addr::from(octets))
        }
        other => {
            let reply = Socks5CommandResponse::error(Socks5Status::AddressTypeNotSupported, ATYP_IPV4);
            stream.write_all(&reply.encode()).await?;
            return Err(ProxyError::ProtocolDecode(format!(
                "unsupported address type: {:#04x}",
                other
            )))
        }
    };

    let port = stream.read_u16().await?;
    debug!("SOCKS5 command {:#04x} for {}:{}", header[1], address, port);

    Ok(Socks5CommandRequest {
        command: header[1],
        address,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_negotiate_selects_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();

        negotiate(&mut server).await.unwrap();

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_auth_only_clients() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();

        assert!(negotiate(&mut server).await.is_err());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_socks4() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x04, 0x01]).await.unwrap();
        assert!(matches!(negotiate(&mut server).await, Err(ProxyError::ProtocolDecode(_))));
    }

    async fn read_request(bytes: &[u8]) -> (Result<Socks5CommandRequest>, tokio::io::DuplexStream) {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(bytes).await.unwrap();
        (read_command_request(&mut server).await, client)
    }

    #[tokio::test]
    async fn test_read_domain_request() {
        let (request, _client) = read_request(&[
            0x05, 0x01, 0x00, 0x03, 4, b'h', b'o', b's', b't', 0x04, 0xD2,
        ])
        .await;
        let request = request.unwrap();
        assert_eq!(request.command, CMD_CONNECT);
        assert_eq!(request.address, Socks5Address::Domain("host".to_string()));
        assert_eq!(request.port, 1234);
        assert_eq!(request.target(), "host:1234");
    }

    #[tokio::test]
    async fn test_read_ip_requests() {
        let (request, _client) = read_request(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50]).await;
        assert_eq!(request.unwrap().target(), "10.0.0.1:80");

        let mut v6 = vec![0x05, 0x01, 0x00, 0x04];
        v6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        v6.extend_from_slice(&443u16.to_be_bytes());
        let (request, _client) = read_request(&v6).await;
        assert_eq!(request.unwrap().target(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_unknown_address_type_gets_reply() {
        let (request, mut client) = read_request(&[0x05, 0x01, 0x00, 0x09, 0, 0]).await;
        assert!(matches!(request, Err(ProxyError::ProtocolDecode(_))));

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_success_echoes_address() {
        let request = Socks5CommandRequest::connect(Socks5Address::Domain("host".to_string()), 1234);
        let reply = Socks5CommandResponse::success(&request).encode();
        assert_eq!(reply, vec![0x05, 0x00, 0x00, 0x03, 4, b'h', b'o', b's', b't', 0x04, 0xD2]);
    }

    #[test]
    fn test_encode_failure_has_no_address() {
        assert_eq!(
            Socks5CommandResponse::failure(ATYP_DOMAIN).encode(),
            vec![0x05, 0x01, 0x00, 0x03, 0, 0, 0]
        );
        assert_eq!(
            Socks5CommandResponse::failure(ATYP_IPV4).encode(),
            vec![0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            Socks5CommandResponse::error(Socks5Status::CommandNotSupported, ATYP_IPV6).encode().len(),
            22
        );
    }
}
