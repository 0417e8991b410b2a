//! Multi-protocol proxy front door.
//!
//! One TCP listener serves SOCKS5, SOCKS4/4a and plain HTTP. The first
//! byte of each connection picks the protocol: 0x05 is SOCKS5, 0x04 is
//! SOCKS4, anything else is treated as HTTP and redirected to the
//! internal HTTP proxy, which chains back into SOCKS5 on this same port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::address::Address;
use crate::error::{ProxyError, Result};
use crate::handler::{Handler, Request};
use crate::logger::log;
use crate::socks::statute::{self, send_reply};
use crate::socks::http;

pub struct ProxyFrontend {
    bind: String,
    handler: Arc<Handler>,
    cancel: CancellationToken,
}

impl ProxyFrontend {
    pub fn new(bind: String, handler: Arc<Handler>, cancel: CancellationToken) -> Self {
        Self {
            bind,
            handler,
            cancel,
        }
    }

    /// Bind and serve until the cancellation token fires.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind).await?;
        self.serve(listener).await
    }

    /// Serve on an existing listener until the cancellation token fires.
    ///
    /// Cancelling drops the listener; in-flight sessions drain on their
    /// own as their peers hang up.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        log::info!(address = %local, "proxy listening");

        // The internal HTTP proxy dials back into this listener; an
        // unspecified bind address is not dialable, loopback is.
        let socks_target = if local.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        } else {
            local
        };
        let http_addr = http::spawn(socks_target, self.cancel.clone()).await?;
        log::debug!(address = %http_addr, "internal http proxy ready");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("shutting down front door");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    log::connection(&peer.to_string(), "new");
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(e) = serve_conn(stream, peer, handler, http_addr).await {
                            log::debug!(peer = %peer, error = %e, "session error");
                        }
                        log::connection(&peer.to_string(), "closed");
                    });
                }
            }
        }
    }
}

async fn serve_conn(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
    http_addr: SocketAddr,
) -> Result<()> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 0 {
        return Ok(());
    }

    match first[0] {
        statute::VERSION_SOCKS5 => serve_socks5(stream, peer, handler).await,
        statute::VERSION_SOCKS4 => serve_socks4(stream, peer, handler).await,
        _ => serve_http_redirect(stream, http_addr).await,
    }
}

async fn serve_socks5(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
) -> Result<()> {
    let method_request = statute::MethodRequest::parse(&mut stream).await?;

    if !method_request.methods.contains(&statute::METHOD_NO_AUTH) {
        stream
            .write_all(&[statute::VERSION_SOCKS5, statute::METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(ProxyError::MethodNotAcceptable);
    }
    stream
        .write_all(&[statute::VERSION_SOCKS5, statute::METHOD_NO_AUTH])
        .await?;

    let request = match statute::Socks5Request::parse(&mut stream).await {
        Ok(request) => request,
        Err(e @ ProxyError::AddrTypeNotSupported(_)) => {
            let _ = send_reply(&mut stream, e.reply_code(), None).await;
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    log::debug!(peer = %peer, command = request.command, dst = %request.dst, "request");

    match request.command {
        statute::CMD_CONNECT => {
            handler
                .handle_connect(
                    stream,
                    Request::new(request.command, request.dst, peer),
                    true,
                )
                .await
        }
        statute::CMD_ASSOCIATE => {
            handler
                .handle_associate(stream, Request::new(request.command, request.dst, peer))
                .await
        }
        other => {
            // BIND is recognized but not implemented; everything else is
            // not even recognized. Same reply either way.
            let _ = send_reply(&mut stream, statute::REP_COMMAND_NOT_SUPPORTED, None).await;
            Err(ProxyError::CommandNotSupported(other))
        }
    }
}

/// Read a NUL-terminated string field (SOCKS4 USERID / SOCKS4a hostname).
async fn read_nul_terminated(stream: &mut TcpStream) -> Result<String> {
    let mut out = Vec::new();
    loop {
        let b = stream.read_u8().await?;
        if b == 0 {
            break;
        }
        if out.len() >= 512 {
            return Err(ProxyError::Protocol("SOCKS4 string field too long".into()));
        }
        out.push(b);
    }
    String::from_utf8(out).map_err(|_| ProxyError::Protocol("SOCKS4 field not UTF-8".into()))
}

async fn serve_socks4(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<Handler>,
) -> Result<()> {
    // VN(1) CD(1) DSTPORT(2) DSTIP(4)
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    let command = header[1];
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip: [u8; 4] = [header[4], header[5], header[6], header[7]];

    if command != statute::CMD_CONNECT {
        return Err(ProxyError::CommandNotSupported(command));
    }

    let _userid = read_nul_terminated(&mut stream).await?;

    // SOCKS4a: DSTIP of 0.0.0.x (x != 0) signals a trailing hostname
    let dst = if ip[0] == 0 && ip[1] == 0 && ip[2] == 0 && ip[3] != 0 {
        let hostname = read_nul_terminated(&mut stream).await?;
        Address::Domain(hostname, port)
    } else {
        Address::IPv4(ip, port)
    };

    stream.write_all(&statute::SOCKS4_SUCCESS_REPLY).await?;

    // The SOCKS4 reply is already on the wire; suppress the SOCKS5 one.
    handler
        .handle_connect(stream, Request::new(statute::CMD_CONNECT, dst, peer), false)
        .await
}

async fn serve_http_redirect(mut stream: TcpStream, http_addr: SocketAddr) -> Result<()> {
    let mut upstream = TcpStream::connect(http_addr).await?;
    upstream.set_nodelay(true)?;
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    Ok(())
}
