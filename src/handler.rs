//! Session orchestration.
//!
//! A parsed request either rides the worker tunnel or goes direct with
//! first-packet fragmentation. Both paths start the same way: reply
//! success, read the opening packet, and extract the destination
//! hostname from it. The direct path then resolves, detects poisoned
//! answers, dials, and pumps; the tunnel path replays the packet into
//! the WebSocket stream.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::{join_host_port, Address};
use crate::dialer::Dialer;
use crate::error::{ProxyError, Result};
use crate::fragment::FragmentStream;
use crate::logger::log;
use crate::pool::BufferPool;
use crate::relay::{self, PrefixedStream};
use crate::resolve::Resolver;
use crate::sniff::{self, Inspected};
use crate::socks::statute::{self, send_reply};
use crate::transport::Transport;

const FIRST_PACKET_MAX: usize = 32 * 1024;

/// Resolvers under DPI interference answer blocked names out of this
/// range; such an answer means "ask the packet instead".
/// TODO: lift the prefix into config once a deployment reports a second
/// sinkhole range.
const DPI_SINKHOLE_PREFIX: &str = "10.10.3";

/// One client request as handed over by the front door.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: u8,
    pub dst: Address,
    pub peer: SocketAddr,
}

impl Request {
    pub fn new(command: u8, dst: Address, peer: SocketAddr) -> Self {
        Self { command, dst, peer }
    }
}

pub struct Handler {
    resolver: Arc<Resolver>,
    dialer: Arc<Dialer>,
    transport: Arc<Transport>,
    worker: crate::config::WorkerPolicy,
    pool: Arc<BufferPool>,
    udp_enabled: bool,
}

impl Handler {
    pub fn new(
        resolver: Arc<Resolver>,
        dialer: Arc<Dialer>,
        transport: Arc<Transport>,
        worker: crate::config::WorkerPolicy,
        pool: Arc<BufferPool>,
        udp_enabled: bool,
    ) -> Self {
        Self {
            resolver,
            dialer,
            transport,
            worker,
            pool,
            udp_enabled,
        }
    }

    /// CONNECT entry point. `success_reply` is false when the frontend
    /// already answered in its own protocol (SOCKS4).
    pub async fn handle_connect(
        &self,
        mut stream: TcpStream,
        mut req: Request,
        success_reply: bool,
    ) -> Result<()> {
        if self.should_tunnel(&req) {
            return self.tunnel_connect(&mut stream, &req, success_reply).await;
        }
        match self
            .fragment_connect(&mut stream, &mut req, success_reply)
            .await
        {
            Err(e) => {
                let _ = send_reply(&mut stream, e.reply_code(), None).await;
                Err(e)
            }
            ok => ok,
        }
    }

    /// ASSOCIATE entry point.
    pub async fn handle_associate(&self, mut stream: TcpStream, req: Request) -> Result<()> {
        if self.worker.enabled && !self.worker.dns_only {
            return self.transport.tunnel_udp(&mut stream, &req.dst).await;
        }
        if !self.udp_enabled {
            let _ = send_reply(&mut stream, statute::REP_COMMAND_NOT_SUPPORTED, None).await;
            return Err(ProxyError::CommandNotSupported(statute::CMD_ASSOCIATE));
        }
        self.transport.direct_associate(&mut stream, &req.dst).await
    }

    /// Sessions go through the tunnel unless they target the worker
    /// itself — the tunnel's own TLS connection must be dialable without
    /// a tunnel.
    fn should_tunnel(&self, req: &Request) -> bool {
        if !self.worker.enabled || self.worker.dns_only {
            return false;
        }
        match req.dst.fqdn() {
            Some(fqdn) if !fqdn.trim().is_empty() => !self.worker.sni.contains(fqdn.trim()),
            _ => true,
        }
    }

    async fn read_first_packet(
        &self,
        stream: &mut TcpStream,
        success_reply: bool,
    ) -> Result<Inspected> {
        if success_reply {
            send_reply(stream, statute::REP_SUCCESS, None).await?;
        }

        let mut buf = vec![0u8; FIRST_PACKET_MAX];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::Protocol(
                "connection closed before first packet".into(),
            ));
        }

        let inspected = sniff::inspect(&buf[..n]);
        if let Some(hostname) = &inspected.hostname {
            log::info!(hostname = %String::from_utf8_lossy(hostname), "first packet hostname");
        }
        Ok(inspected)
    }

    async fn resolve_destination(&self, req: &Request) -> Result<String> {
        match req.dst.fqdn() {
            Some(fqdn) => {
                let ip = self.resolver.resolve(fqdn).await?;
                log::info!(fqdn = fqdn, ip = %ip, "resolved destination");
                Ok(join_host_port(&ip, req.dst.port()))
            }
            None => Ok(req.dst.to_string()),
        }
    }

    async fn fragment_connect(
        &self,
        stream: &mut TcpStream,
        req: &mut Request,
        success_reply: bool,
    ) -> Result<()> {
        let inspected = self.read_first_packet(stream, success_reply).await?;
        let mut ip_port = self.resolve_destination(req).await?;

        if let Some(hostname) = &inspected.hostname {
            if ip_port.contains(DPI_SINKHOLE_PREFIX) {
                // A poisoned resolver answered; the first packet knows the
                // real name. If that fails too, connecting to the sinkhole
                // is pointless.
                log::info!(ip = %ip_port, "resolved into DPI sinkhole, re-resolving from first packet");
                req.dst
                    .set_fqdn(String::from_utf8_lossy(hostname).into_owned());
                ip_port = self.resolve_destination(req).await?;
            }
        }

        log::info!(target = %ip_port, peer = %req.peer, "dialing");
        let conn = self
            .dialer
            .tcp_dial(&ip_port)
            .await
            .map_err(|e| ProxyError::from_connect(&ip_port, e))?;

        let (sent, received) = if inspected.is_http {
            // The case-mangled head must leave as one piece.
            let mut conn = conn;
            conn.write_all(&inspected.data).await?;
            relay::pump(&mut *stream, conn, &self.pool).await?
        } else if let Some(policy) = self.dialer.fragment_policy() {
            let mut conn = FragmentStream::new(conn, policy);
            conn.write_all(&inspected.data).await?;
            conn.flush().await?;
            relay::pump(&mut *stream, conn, &self.pool).await?
        } else {
            let mut conn = conn;
            conn.write_all(&inspected.data).await?;
            relay::pump(&mut *stream, conn, &self.pool).await?
        };

        log::debug!(target = %ip_port, sent = sent, received = received, "session finished");
        Ok(())
    }

    async fn tunnel_connect(
        &self,
        stream: &mut TcpStream,
        req: &Request,
        success_reply: bool,
    ) -> Result<()> {
        let inspected = self.read_first_packet(stream, success_reply).await?;

        let prefixed = PrefixedStream::new(Bytes::from(inspected.data), &mut *stream);
        match self.transport.tunnel_tcp(prefixed, &req.dst).await {
            Err(e) => {
                let _ = send_reply(stream, statute::REP_SERVER_FAILURE, None).await;
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }
}
