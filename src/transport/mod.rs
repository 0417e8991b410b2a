//! Worker transport: session paths that ride the WebSocket tunnel, plus
//! the direct UDP relay used when no worker is configured.

pub mod tunnel;
pub mod ws;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::address::Address;
use crate::error::{ProxyError, Result};
use crate::logger::log;
use crate::pool::BufferPool;
use crate::relay;
use crate::socks::datagram::Datagram;
use crate::socks::statute::{self, send_reply};
use tunnel::{UdpPacket, WsTunnel};

/// Unified stream trait for relay endpoints.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed stream type produced by the dialer.
pub type TransportStream = Pin<Box<dyn AsyncStream>>;

const UDP_BIND_QUEUE_CAPACITY: usize = 64;

pub struct Transport {
    pool: Arc<BufferPool>,
    tunnel: Arc<WsTunnel>,
    udp_bind: String,
    session_id: String,
    worker_sni: String,
}

impl Transport {
    pub fn new(
        pool: Arc<BufferPool>,
        tunnel: Arc<WsTunnel>,
        udp_bind: String,
        session_id: String,
        worker_sni: String,
    ) -> Self {
        Self {
            pool,
            tunnel,
            udp_bind,
            session_id,
            worker_sni,
        }
    }

    /// Worker endpoint URL for one session.
    pub fn ws_endpoint(&self, dst: &Address, net: &str) -> String {
        format!(
            "wss://{}/connect?host={}&port={}&net={}&session={}",
            self.worker_sni,
            dst.host(),
            dst.port(),
            net,
            self.session_id
        )
    }

    /// Carry one TCP session over a fresh WebSocket.
    pub async fn tunnel_tcp<S>(&self, client: S, dst: &Address) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let endpoint = self.ws_endpoint(dst, "tcp");
        let mut ws = self.tunnel.dial(&endpoint).await?;

        // An empty frame pushes the TLS+WS handshakes fully onto the wire
        // before client bytes arrive.
        ws.send(Message::Binary(Bytes::new()))
            .await
            .map_err(|e| ProxyError::Tunnel(format!("handshake flush: {e}")))?;

        let ws_stream = ws::WsStream::new(ws, endpoint.clone());
        let (sent, received) = relay::pump(client, ws_stream, &self.pool).await?;
        log::debug!(endpoint = %endpoint, sent = sent, received = received, "tunnel session done");
        Ok(())
    }

    /// UDP ASSOCIATE via the shared multiplexed tunnel.
    ///
    /// Datagrams from the client are stripped of their SOCKS header and
    /// pushed into the tunnel tagged with this session's channel; frames
    /// coming back are re-wrapped naming the requested destination and
    /// sent to the last-seen client source.
    pub async fn tunnel_udp(&self, control: &mut TcpStream, dst: &Address) -> Result<()> {
        let socket = match UdpSocket::bind(format!("{}:0", self.udp_bind)).await {
            Ok(socket) => socket,
            Err(e) => {
                let _ = send_reply(control, statute::REP_SERVER_FAILURE, None).await;
                return Err(ProxyError::Io(e));
            }
        };
        let local = socket.local_addr()?;
        log::info!(bind = %local, "udp associate listening");
        send_reply(control, statute::REP_SUCCESS, Some(local)).await?;

        let endpoint = self.ws_endpoint(dst, "udp");
        let (bind_tx, mut bind_rx) = mpsc::channel::<UdpPacket>(UDP_BIND_QUEUE_CAPACITY);
        let (tunnel_tx, channel) = self.tunnel.persistent_dial(&endpoint, bind_tx);
        let _unbind = scopeguard::guard(
            (Arc::clone(&self.tunnel), endpoint.clone(), channel),
            |(tunnel, endpoint, channel)| {
                tunnel.unregister(&endpoint, channel);
            },
        );

        let mut slab = self.pool.get();
        let mut probe = [0u8; 512];
        let mut client_addr: Option<SocketAddr> = None;

        let result: Result<()> = loop {
            tokio::select! {
                received = socket.recv_from(&mut slab) => {
                    let (n, from) = match received {
                        Ok(pair) => pair,
                        Err(e) => break Err(ProxyError::Io(e)),
                    };
                    client_addr = Some(from);
                    match Datagram::decode(&slab[..n]) {
                        Ok(datagram) => {
                            let packet = UdpPacket { channel, data: datagram.data };
                            if tunnel_tx.try_send(packet).is_err() {
                                log::debug!(endpoint = %endpoint, "tunnel queue full, dropping datagram");
                            }
                        }
                        Err(reason) => {
                            log::debug!(reason = reason, "dropping malformed datagram");
                        }
                    }
                }
                incoming = bind_rx.recv() => {
                    let Some(packet) = incoming else { break Ok(()) };
                    if let Some(client) = client_addr {
                        let wire = Datagram::new(dst.clone(), packet.data).encode();
                        if let Err(e) = socket.send_to(&wire, client).await {
                            log::debug!(error = %e, "udp reply send failed");
                        }
                    }
                }
                read = control.read(&mut probe) => {
                    match read {
                        Ok(0) | Err(_) => break Ok(()),
                        Ok(_) => {}
                    }
                }
            }
        };

        self.pool.put(slab);
        result
    }

    /// UDP ASSOCIATE without a worker: a plain local relay socket.
    pub async fn direct_associate(&self, control: &mut TcpStream, _dst: &Address) -> Result<()> {
        let socket = match UdpSocket::bind(format!("{}:0", self.udp_bind)).await {
            Ok(socket) => socket,
            Err(e) => {
                let _ = send_reply(control, statute::REP_SERVER_FAILURE, None).await;
                return Err(ProxyError::Io(e));
            }
        };
        let local = socket.local_addr()?;
        log::info!(bind = %local, "direct udp associate listening");
        send_reply(control, statute::REP_SUCCESS, Some(local)).await?;

        let mut slab = self.pool.get();
        let mut probe = [0u8; 512];
        let mut client_addr: Option<SocketAddr> = None;

        let result: Result<()> = loop {
            tokio::select! {
                received = socket.recv_from(&mut slab) => {
                    let (n, from) = match received {
                        Ok(pair) => pair,
                        Err(e) => break Err(ProxyError::Io(e)),
                    };
                    let from_client = match client_addr {
                        None => true,
                        Some(addr) => addr == from || addr.ip() == from.ip(),
                    };
                    if from_client {
                        client_addr = Some(from);
                        match Datagram::decode(&slab[..n]) {
                            Ok(datagram) => match datagram.dst.to_socket_addr().await {
                                Ok(target) => {
                                    if let Err(e) = socket.send_to(&datagram.data, target).await {
                                        log::debug!(error = %e, target = %target, "udp forward failed");
                                    }
                                }
                                Err(e) => {
                                    log::debug!(error = %e, "udp target unresolvable");
                                }
                            },
                            Err(reason) => {
                                log::debug!(reason = reason, "dropping malformed datagram");
                            }
                        }
                    } else if let Some(client) = client_addr {
                        let wire =
                            Datagram::new(Address::from(from), Bytes::copy_from_slice(&slab[..n]))
                                .encode();
                        if let Err(e) = socket.send_to(&wire, client).await {
                            log::debug!(error = %e, "udp reply send failed");
                        }
                    }
                }
                read = control.read(&mut probe) => {
                    match read {
                        Ok(0) | Err(_) => break Ok(()),
                        Ok(_) => {}
                    }
                }
            }
        };

        self.pool.put(slab);
        result
    }
}
