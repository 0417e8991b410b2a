use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, Result};

const DNS_RESOLVE_TIMEOUT_SECS: u64 = 10;

/// Address type constants (SOCKS5 wire encoding, RFC 1928)
pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

/// Address decode result
#[derive(Debug)]
pub enum DecodeResult {
    /// Successfully decoded address with consumed bytes count
    Ok(Address, usize),
    /// Need more data to complete decoding
    NeedMoreData,
    /// Invalid address format
    Invalid(&'static str),
}

/// Destination address as carried in SOCKS requests and UDP datagrams.
///
/// Exactly one representation is held: a literal IP or a domain name. After
/// resolution the session works with a concrete `ip:port` string; the raw
/// address is kept for datagram headers and worker endpoint URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4([u8; 4], u16),
    IPv6([u8; 16], u16),
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", Ipv4Addr::from(*ip), port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl Address {
    /// Decode address from buffer (SOCKS5 format)
    ///
    /// Format:
    /// - IPv4: 1 byte type (0x01) + 4 bytes IP + 2 bytes port
    /// - Domain: 1 byte type (0x03) + 1 byte length + domain + 2 bytes port
    /// - IPv6: 1 byte type (0x04) + 16 bytes IP + 2 bytes port
    pub fn decode(buf: &[u8]) -> DecodeResult {
        if buf.is_empty() {
            return DecodeResult::NeedMoreData;
        }

        let atyp = buf[0];
        let mut cursor = 1;

        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[cursor..cursor + 4]);
                cursor += 4;
                let port = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]);
                cursor += 2;
                DecodeResult::Ok(Address::IPv4(ip, port), cursor)
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return DecodeResult::NeedMoreData;
                }
                let domain_len = buf[cursor] as usize;
                cursor += 1;

                if buf.len() < 2 + domain_len + 2 {
                    return DecodeResult::NeedMoreData;
                }

                let domain = match std::str::from_utf8(&buf[cursor..cursor + domain_len]) {
                    Ok(s) => s.to_string(),
                    Err(_) => return DecodeResult::Invalid("invalid UTF-8 in domain"),
                };
                cursor += domain_len;
                let port = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]);
                cursor += 2;
                DecodeResult::Ok(Address::Domain(domain, port), cursor)
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return DecodeResult::NeedMoreData;
                }
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[cursor..cursor + 16]);
                cursor += 16;
                let port = u16::from_be_bytes([buf[cursor], buf[cursor + 1]]);
                cursor += 2;
                DecodeResult::Ok(Address::IPv6(ip, port), cursor)
            }
            _ => DecodeResult::Invalid("unknown address type"),
        }
    }

    /// Encode address to buffer (SOCKS5 format)
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Address::IPv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::IPv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// Get encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        match self {
            Address::IPv4(_, _) => 1 + 4 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
            Address::IPv6(_, _) => 1 + 16 + 2,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) => *port,
            Address::IPv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Domain name, if this address carries one.
    pub fn fqdn(&self) -> Option<&str> {
        match self {
            Address::Domain(domain, _) => Some(domain.as_str()),
            _ => None,
        }
    }

    /// Replace the domain name, keeping the port. Used when the destination
    /// hostname is recovered from the first packet instead of the request.
    pub fn set_fqdn(&mut self, fqdn: String) {
        let port = self.port();
        *self = Address::Domain(fqdn, port);
    }

    /// Host part only, bracketed for IPv6. Suitable for URL query values.
    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => Ipv4Addr::from(*ip).to_string(),
            Address::IPv6(ip, _) => format!("[{}]", Ipv6Addr::from(*ip)),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Build from a resolved IP string and this address's port.
    pub fn from_ip_str(ip: &str, port: u16) -> Option<Address> {
        let trimmed = ip.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) => Some(Address::IPv4(v4.octets(), port)),
            IpAddr::V6(v6) => Some(Address::IPv6(v6.octets(), port)),
        }
    }

    pub async fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => {
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*ip)), *port))
            }
            Address::IPv6(ip, port) => {
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port))
            }
            Address::Domain(domain, port) => {
                let addrs = tokio::time::timeout(
                    tokio::time::Duration::from_secs(DNS_RESOLVE_TIMEOUT_SECS),
                    tokio::net::lookup_host((domain.as_str(), *port)),
                )
                .await
                .map_err(|_| {
                    anyhow!(
                        "DNS resolution timeout after {} seconds",
                        DNS_RESOLVE_TIMEOUT_SECS
                    )
                })??;
                addrs
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("Failed to resolve domain: {}", domain))
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::IPv4(v4.ip().octets(), v4.port()),
            SocketAddr::V6(v6) => Address::IPv6(v6.ip().octets(), v6.port()),
        }
    }
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ipv4() {
        let mut buf = Vec::new();
        buf.push(ATYP_IPV4);
        buf.extend_from_slice(&[192, 168, 1, 1]);
        buf.extend_from_slice(&8080u16.to_be_bytes());

        match Address::decode(&buf) {
            DecodeResult::Ok(addr, consumed) => {
                assert_eq!(consumed, 7);
                assert_eq!(addr, Address::IPv4([192, 168, 1, 1], 8080));
            }
            _ => panic!("Expected successful decode"),
        }
    }

    #[test]
    fn test_decode_ipv6() {
        let ip = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let mut buf = Vec::new();
        buf.push(ATYP_IPV6);
        buf.extend_from_slice(&ip);
        buf.extend_from_slice(&443u16.to_be_bytes());

        match Address::decode(&buf) {
            DecodeResult::Ok(addr, consumed) => {
                assert_eq!(consumed, 19);
                assert_eq!(addr, Address::IPv6(ip, 443));
            }
            _ => panic!("Expected successful decode"),
        }
    }

    #[test]
    fn test_decode_domain() {
        let mut buf = Vec::new();
        buf.push(ATYP_DOMAIN);
        buf.push(11);
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&80u16.to_be_bytes());

        match Address::decode(&buf) {
            DecodeResult::Ok(addr, consumed) => {
                assert_eq!(consumed, 1 + 1 + 11 + 2);
                assert_eq!(addr, Address::Domain("example.com".to_string(), 80));
            }
            _ => panic!("Expected successful decode"),
        }
    }

    #[test]
    fn test_decode_need_more_data() {
        assert!(matches!(Address::decode(&[]), DecodeResult::NeedMoreData));
        assert!(matches!(
            Address::decode(&[ATYP_IPV4, 192, 168]),
            DecodeResult::NeedMoreData
        ));
        assert!(matches!(
            Address::decode(&[ATYP_DOMAIN, 10, b'e', b'x']),
            DecodeResult::NeedMoreData
        ));
    }

    #[test]
    fn test_decode_invalid_type() {
        let buf = [0x99, 0, 0, 0, 0];
        assert!(matches!(Address::decode(&buf), DecodeResult::Invalid(_)));
    }

    #[test]
    fn test_decode_invalid_utf8_domain() {
        let mut buf = Vec::new();
        buf.push(ATYP_DOMAIN);
        buf.push(4);
        buf.extend_from_slice(&[0xFF, 0xFE, 0xFF, 0xFE]);
        buf.extend_from_slice(&80u16.to_be_bytes());

        assert!(matches!(Address::decode(&buf), DecodeResult::Invalid(_)));
    }

    #[test]
    fn test_roundtrip_every_atyp() {
        let addrs = [
            Address::IPv4([10, 20, 30, 40], 12345),
            Address::IPv6([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16], 65535),
            Address::Domain("sub.domain.example.org".to_string(), 8443),
        ];
        for original in addrs {
            let mut buf = Vec::new();
            original.encode(&mut buf);
            match Address::decode(&buf) {
                DecodeResult::Ok(decoded, consumed) => {
                    assert_eq!(consumed, buf.len());
                    assert_eq!(decoded, original);
                    assert_eq!(original.encoded_size(), buf.len());
                }
                _ => panic!("Roundtrip failed"),
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Address::IPv4([192, 168, 1, 1], 8080).to_string(),
            "192.168.1.1:8080"
        );
        assert_eq!(
            Address::IPv6([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 443).to_string(),
            "[::1]:443"
        );
        assert_eq!(
            Address::Domain("example.com".to_string(), 80).to_string(),
            "example.com:80"
        );
    }

    #[test]
    fn test_host_brackets_ipv6() {
        let v6 = Address::IPv6([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 443);
        assert_eq!(v6.host(), "[::1]");
        let v4 = Address::IPv4([127, 0, 0, 1], 80);
        assert_eq!(v4.host(), "127.0.0.1");
    }

    #[test]
    fn test_set_fqdn_keeps_port() {
        let mut addr = Address::IPv4([10, 10, 3, 7], 443);
        addr.set_fqdn("blocked.test".to_string());
        assert_eq!(addr, Address::Domain("blocked.test".to_string(), 443));
    }

    #[test]
    fn test_from_ip_str() {
        assert_eq!(
            Address::from_ip_str("93.184.216.34", 443),
            Some(Address::IPv4([93, 184, 216, 34], 443))
        );
        assert_eq!(
            Address::from_ip_str("[::1]", 53),
            Some(Address::IPv6([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 53))
        );
        assert_eq!(Address::from_ip_str("not-an-ip", 1), None);
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("1.2.3.4", 80), "1.2.3.4:80");
        assert_eq!(join_host_port("::1", 80), "[::1]:80");
        assert_eq!(join_host_port("[::1]", 80), "[::1]:80");
        assert_eq!(join_host_port("example.com", 443), "example.com:443");
    }

    #[tokio::test]
    async fn test_ipv4_to_socket_addr() {
        let addr = Address::IPv4([127, 0, 0, 1], 8080);
        let socket_addr = addr.to_socket_addr().await.unwrap();
        assert_eq!(socket_addr.to_string(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_domain_to_socket_addr_localhost() {
        let addr = Address::Domain("localhost".to_string(), 8080);
        assert!(addr.to_socket_addr().await.is_ok());
    }

    #[test]
    fn test_from_socket_addr() {
        let sa: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        assert_eq!(Address::from(sa), Address::IPv4([10, 0, 0, 1], 1234));
    }
}
