//! SOCKS wire statute: protocol constants, negotiation packets, requests
//! and replies (RFC 1928).

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::error::ProxyError;

pub const VERSION_SOCKS5: u8 = 0x05;
pub const VERSION_SOCKS4: u8 = 0x04;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_ASSOCIATE: u8 = 0x03;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_SERVER_FAILURE: u8 = 0x01;
pub const REP_RULE_FAILURE: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS4 success reply: VN=0, CD=90, port and address zeroed.
pub const SOCKS4_SUCCESS_REPLY: [u8; 8] = [0x00, 0x5A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Method negotiation request:
///
/// ```text
/// +-----+----------+---------------+
/// | VER | NMETHODS |    METHODS    |
/// +-----+----------+---------------+
/// |  1  |     1    | X'00' - X'FF' |
/// +-----+----------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl MethodRequest {
    pub async fn parse<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProxyError> {
        let version = r.read_u8().await?;
        if version != VERSION_SOCKS5 {
            return Err(ProxyError::Protocol(format!(
                "unexpected SOCKS version {version}"
            )));
        }
        let n_methods = r.read_u8().await?;
        let mut methods = vec![0u8; n_methods as usize];
        r.read_exact(&mut methods).await?;
        Ok(Self { version, methods })
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.methods.len());
        out.push(self.version);
        out.push(self.methods.len() as u8);
        out.extend_from_slice(&self.methods);
        out
    }
}

/// The SOCKS5 request following method negotiation:
///
/// ```text
/// +-----+-----+-------+------+----------+----------+
/// | VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +-----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub version: u8,
    pub command: u8,
    pub dst: Address,
}

impl Socks5Request {
    pub async fn parse<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProxyError> {
        let mut header = [0u8; 4];
        r.read_exact(&mut header).await?;
        let version = header[0];
        if version != VERSION_SOCKS5 {
            return Err(ProxyError::Protocol(format!(
                "unexpected request version {version}"
            )));
        }
        let command = header[1];
        let atyp = header[3];
        let dst = read_address(r, atyp).await?;
        Ok(Self {
            version,
            command,
            dst,
        })
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.dst.encoded_size());
        out.push(self.version);
        out.push(self.command);
        out.push(0x00);
        self.dst.encode(&mut out);
        out
    }
}

/// Read an address given an already-consumed ATYP byte.
pub async fn read_address<R: AsyncRead + Unpin>(
    r: &mut R,
    atyp: u8,
) -> Result<Address, ProxyError> {
    match atyp {
        crate::address::ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            r.read_exact(&mut ip).await?;
            let port = r.read_u16().await?;
            Ok(Address::IPv4(ip, port))
        }
        crate::address::ATYP_DOMAIN => {
            let len = r.read_u8().await? as usize;
            let mut raw = vec![0u8; len];
            r.read_exact(&mut raw).await?;
            let domain = String::from_utf8(raw)
                .map_err(|_| ProxyError::Protocol("invalid UTF-8 in domain".into()))?;
            let port = r.read_u16().await?;
            Ok(Address::Domain(domain, port))
        }
        crate::address::ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            r.read_exact(&mut ip).await?;
            let port = r.read_u16().await?;
            Ok(Address::IPv6(ip, port))
        }
        other => Err(ProxyError::AddrTypeNotSupported(other)),
    }
}

/// Serialize a reply. The bound address defaults to 0.0.0.0:0 and is only
/// meaningful for successful BIND/ASSOCIATE replies.
pub fn reply_bytes(rep: u8, bind_addr: Option<SocketAddr>) -> Vec<u8> {
    let addr = match bind_addr {
        Some(sa) if rep == REP_SUCCESS => Address::from(sa),
        _ => Address::IPv4([0, 0, 0, 0], 0),
    };
    let mut out = Vec::with_capacity(4 + addr.encoded_size());
    out.push(VERSION_SOCKS5);
    out.push(rep);
    out.push(0x00);
    addr.encode(&mut out);
    out
}

pub async fn send_reply<W: AsyncWrite + Unpin>(
    w: &mut W,
    rep: u8,
    bind_addr: Option<SocketAddr>,
) -> std::io::Result<()> {
    w.write_all(&reply_bytes(rep, bind_addr)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_method_request_roundtrip() {
        let raw = vec![VERSION_SOCKS5, 2, METHOD_NO_AUTH, 0x02];
        let mut cursor = Cursor::new(raw.clone());
        let mr = MethodRequest::parse(&mut cursor).await.unwrap();
        assert_eq!(mr.methods, vec![METHOD_NO_AUTH, 0x02]);
        assert_eq!(mr.bytes(), raw);
    }

    #[tokio::test]
    async fn test_method_request_bad_version() {
        let mut cursor = Cursor::new(vec![0x06, 1, 0]);
        assert!(MethodRequest::parse(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_request_roundtrip_every_atyp() {
        let requests = [
            Socks5Request {
                version: VERSION_SOCKS5,
                command: CMD_CONNECT,
                dst: Address::IPv4([93, 184, 216, 34], 443),
            },
            Socks5Request {
                version: VERSION_SOCKS5,
                command: CMD_ASSOCIATE,
                dst: Address::IPv6([0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 53),
            },
            Socks5Request {
                version: VERSION_SOCKS5,
                command: CMD_CONNECT,
                dst: Address::Domain("example.com".to_string(), 443),
            },
        ];
        for original in requests {
            let raw = original.bytes();
            let mut cursor = Cursor::new(raw.clone());
            let parsed = Socks5Request::parse(&mut cursor).await.unwrap();
            assert_eq!(parsed, original);
            assert_eq!(parsed.bytes(), raw);
        }
    }

    #[tokio::test]
    async fn test_request_unknown_atyp() {
        let raw = vec![VERSION_SOCKS5, CMD_CONNECT, 0x00, 0x09, 1, 2, 3, 4, 0, 80];
        let mut cursor = Cursor::new(raw);
        match Socks5Request::parse(&mut cursor).await {
            Err(ProxyError::AddrTypeNotSupported(9)) => {}
            other => panic!("expected AddrTypeNotSupported, got {other:?}"),
        }
    }

    #[test]
    fn test_reply_bytes_default_bind() {
        let raw = reply_bytes(REP_SUCCESS, None);
        assert_eq!(
            raw,
            vec![VERSION_SOCKS5, REP_SUCCESS, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_reply_bytes_with_bind_addr() {
        let bind: SocketAddr = "127.0.0.1:61000".parse().unwrap();
        let raw = reply_bytes(REP_SUCCESS, Some(bind));
        assert_eq!(raw[0], VERSION_SOCKS5);
        assert_eq!(raw[1], REP_SUCCESS);
        assert_eq!(raw[3], crate::address::ATYP_IPV4);
        assert_eq!(&raw[4..8], &[127, 0, 0, 1]);
        assert_eq!(u16::from_be_bytes([raw[8], raw[9]]), 61000);
    }

    #[test]
    fn test_reply_bytes_failure_zeroes_bind() {
        let bind: SocketAddr = "127.0.0.1:61000".parse().unwrap();
        let raw = reply_bytes(REP_HOST_UNREACHABLE, Some(bind));
        assert_eq!(&raw[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_socks4_success_reply_shape() {
        assert_eq!(SOCKS4_SUCCESS_REPLY[0], 0x00);
        assert_eq!(SOCKS4_SUCCESS_REPLY[1], 90);
        assert!(SOCKS4_SUCCESS_REPLY[2..].iter().all(|b| *b == 0));
    }
}
