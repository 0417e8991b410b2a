//! Internal HTTP proxy.
//!
//! Plain HTTP and HTTP CONNECT clients that hit the main listening port
//! are redirected here. This proxy parses the request head, then chains
//! into the SOCKS5 front door on the same process, so HTTP traffic gets
//! the identical inspection/fragmentation treatment as native SOCKS
//! sessions.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::error::ProxyError;
use crate::logger::log;
use crate::socks::statute;

const MAX_HEAD_BYTES: usize = 32 * 1024;

/// Bind the internal HTTP proxy on an ephemeral loopback port.
///
/// Returns the bound address; the accept loop runs until cancellation.
pub async fn spawn(
    socks_addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let local = listener.local_addr()?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!(error = %e, "http proxy accept failed");
                            continue;
                        }
                    };
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, socks_addr).await {
                            log::debug!(peer = %peer, error = %e, "http proxy session error");
                        }
                    });
                }
            }
        }
    });

    Ok(local)
}

async fn serve(mut client: TcpStream, socks_addr: SocketAddr) -> Result<(), ProxyError> {
    let mut head = BytesMut::with_capacity(4 * 1024);
    let head_len = loop {
        if head.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Protocol("request head too large".into()));
        }
        let mut chunk = [0u8; 4096];
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Protocol("connection closed mid-head".into()));
        }
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&head) {
            break pos;
        }
    };

    let (method, target) = parse_request_line(&head[..head_len])?;

    if method == "CONNECT" {
        let (host, port) = split_host_port(&target, 443)?;
        let mut upstream = socks5_connect(socks_addr, &host, port).await?;
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        // Bytes past the head (early TLS data) must reach the upstream.
        if head.len() > head_len {
            upstream.write_all(&head[head_len..]).await?;
        }
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        return Ok(());
    }

    let (host, port) = request_target(&target, &head[..head_len])?;
    let mut upstream = socks5_connect(socks_addr, &host, port).await?;
    upstream.write_all(&head).await?;
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn parse_request_line(head: &[u8]) -> Result<(String, String), ProxyError> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| ProxyError::Protocol("missing request line".into()))?;
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| ProxyError::Protocol("request line is not UTF-8".into()))?;
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::Protocol("empty request line".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| ProxyError::Protocol("missing request target".into()))?;
    Ok((method.to_string(), target.to_string()))
}

fn split_host_port(target: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    if let Some(rest) = target.strip_prefix('[') {
        // [v6]:port or bare [v6]
        if let Some((host, port)) = rest.split_once("]:") {
            let port = port
                .parse()
                .map_err(|_| ProxyError::Protocol(format!("bad port in {target}")))?;
            return Ok((host.to_string(), port));
        }
        let host = rest.trim_end_matches(']');
        return Ok((host.to_string(), default_port));
    }
    match target.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) && !port.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| ProxyError::Protocol(format!("bad port in {target}")))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((target.to_string(), default_port)),
    }
}

/// Resolve the destination of a non-CONNECT request: absolute-form URI
/// first, Host header otherwise.
fn request_target(target: &str, head: &[u8]) -> Result<(String, u16), ProxyError> {
    if let Some(rest) = target.strip_prefix("http://") {
        let authority = rest.split('/').next().unwrap_or(rest);
        return split_host_port(authority, 80);
    }
    let head_text = std::str::from_utf8(head)
        .map_err(|_| ProxyError::Protocol("request head is not UTF-8".into()))?;
    for line in head_text.split("\r\n").skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("host") {
                return split_host_port(value.trim(), 80);
            }
        }
    }
    Err(ProxyError::Protocol("no Host header and no absolute URI".into()))
}

/// Minimal SOCKS5 client handshake against our own front door.
async fn socks5_connect(
    socks_addr: SocketAddr,
    host: &str,
    port: u16,
) -> Result<TcpStream, ProxyError> {
    let mut stream = TcpStream::connect(socks_addr).await?;
    stream.set_nodelay(true)?;

    stream
        .write_all(&[statute::VERSION_SOCKS5, 1, statute::METHOD_NO_AUTH])
        .await?;
    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await?;
    if method_reply != [statute::VERSION_SOCKS5, statute::METHOD_NO_AUTH] {
        return Err(ProxyError::Protocol("SOCKS5 method negotiation failed".into()));
    }

    let dst = match Address::from_ip_str(host, port) {
        Some(addr) => addr,
        None => Address::Domain(host.to_string(), port),
    };
    let request = statute::Socks5Request {
        version: statute::VERSION_SOCKS5,
        command: statute::CMD_CONNECT,
        dst,
    };
    stream.write_all(&request.bytes()).await?;

    let mut reply_header = [0u8; 4];
    stream.read_exact(&mut reply_header).await?;
    let _bind = statute::read_address(&mut stream, reply_header[3]).await?;
    if reply_header[1] != statute::REP_SUCCESS {
        return Err(ProxyError::Protocol(format!(
            "SOCKS5 CONNECT failed with reply {}",
            reply_header[1]
        )));
    }
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let head = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (method, target) = parse_request_line(head).unwrap();
        assert_eq!(method, "CONNECT");
        assert_eq!(target, "example.com:443");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:8443", 443).unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            split_host_port("example.com", 443).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("[::1]:8080", 443).unwrap(),
            ("::1".to_string(), 8080)
        );
        assert_eq!(
            split_host_port("[::1]", 443).unwrap(),
            ("::1".to_string(), 443)
        );
    }

    #[test]
    fn test_request_target_absolute_uri() {
        let head = b"GET http://foo.test:8080/path HTTP/1.1\r\n\r\n";
        let (host, port) = request_target("http://foo.test:8080/path", head).unwrap();
        assert_eq!(host, "foo.test");
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_request_target_host_header() {
        let head = b"GET / HTTP/1.1\r\nHost: foo.test\r\n\r\n";
        let (host, port) = request_target("/", head).unwrap();
        assert_eq!(host, "foo.test");
        assert_eq!(port, 80);
    }

    #[test]
    fn test_request_target_missing_host() {
        let head = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert!(request_target("/", head).is_err());
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nrest"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
