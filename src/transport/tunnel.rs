//! Persistent multiplexed WebSocket tunnel.
//!
//! One long-lived WebSocket per endpoint URL carries many UDP bindings,
//! each tagged with a 16-bit channel id. Channel ids are allocated
//! monotonically starting at 1. The tunnel task reconnects on transient
//! failures (normal closes, per-frame deadline misses) up to a fixed
//! attempt budget, and tears itself down once the link sits idle.
//!
//! Wire format:
//!
//! ```text
//! request:  [ClientID: 6][Channel: u16 BE][payload]
//! response: [Channel: u16 BE][payload]
//! ```

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::config::WorkerPolicy;
use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::logger::log;
use crate::transport::TransportStream;

/// Reconnect attempt budget per tunnel.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Pause after a failed dial before the next attempt.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
/// Outbound queue depth; overflow drops packets, like UDP itself.
const TUNNEL_QUEUE_CAPACITY: usize = 64;

/// A datagram tagged with its tunnel channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub channel: u16,
    pub data: Bytes,
}

/// Request-direction frame: `ClientID || channel || payload`.
pub fn encode_request_frame(client_id: &str, packet: &UdpPacket) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + 2 + packet.data.len());
    frame.extend_from_slice(client_id.as_bytes());
    frame.extend_from_slice(&packet.channel.to_be_bytes());
    frame.extend_from_slice(&packet.data);
    frame
}

/// Response-direction frame: `channel || payload`. Short frames are noise.
pub fn decode_response_frame(data: &[u8]) -> Option<UdpPacket> {
    if data.len() < 2 {
        return None;
    }
    Some(UdpPacket {
        channel: u16::from_be_bytes([data[0], data[1]]),
        data: Bytes::copy_from_slice(&data[2..]),
    })
}

type BindMap = Arc<DashMap<u16, mpsc::Sender<UdpPacket>>>;

struct TunnelShared {
    send: mpsc::Sender<UdpPacket>,
    binds: BindMap,
    next_channel: AtomicU16,
}

pub struct WsTunnel {
    dialer: Arc<Dialer>,
    worker: WorkerPolicy,
    read_timeout: Duration,
    write_timeout: Duration,
    link_idle_timeout: Duration,
    client_id: String,
    tunnels: DashMap<String, TunnelShared>,
}

impl WsTunnel {
    pub fn new(
        dialer: Arc<Dialer>,
        worker: WorkerPolicy,
        frame_timeout: Duration,
        link_idle_timeout: Duration,
        client_id: String,
    ) -> Self {
        Self {
            dialer,
            worker,
            read_timeout: frame_timeout,
            write_timeout: frame_timeout,
            link_idle_timeout,
            client_id,
            tunnels: DashMap::new(),
        }
    }

    /// Dial a fresh WebSocket to the worker over our own TLS underlay.
    pub async fn dial(
        &self,
        endpoint: &str,
    ) -> Result<WebSocketStream<TransportStream>, ProxyError> {
        let stream = self
            .dialer
            .tls_dial(&self.worker.host, &self.worker.sni)
            .await
            .map_err(|e| ProxyError::Tunnel(format!("dial {}: {e}", self.worker.host)))?;
        let (ws, _response) = tokio_tungstenite::client_async(endpoint, stream)
            .await
            .map_err(|e| ProxyError::Tunnel(format!("websocket upgrade: {e}")))?;
        Ok(ws)
    }

    /// Join (or create) the shared tunnel for `endpoint`.
    ///
    /// Returns the tunnel's send queue and the channel id allocated for
    /// this binding; frames arriving on that channel are delivered to
    /// `bind`.
    pub fn persistent_dial(
        self: &Arc<Self>,
        endpoint: &str,
        bind: mpsc::Sender<UdpPacket>,
    ) -> (mpsc::Sender<UdpPacket>, u16) {
        use dashmap::mapref::entry::Entry;

        match self.tunnels.entry(endpoint.to_string()) {
            Entry::Occupied(entry) => {
                let shared = entry.get();
                let channel = shared.next_channel.fetch_add(1, Ordering::SeqCst);
                shared.binds.insert(channel, bind);
                (shared.send.clone(), channel)
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(TUNNEL_QUEUE_CAPACITY);
                let binds: BindMap = Arc::new(DashMap::new());
                binds.insert(1u16, bind);
                entry.insert(TunnelShared {
                    send: tx.clone(),
                    binds: Arc::clone(&binds),
                    next_channel: AtomicU16::new(2),
                });
                tokio::spawn(Arc::clone(self).run(endpoint.to_string(), rx, binds));
                (tx, 1)
            }
        }
    }

    /// Drop a binding when its session ends.
    pub fn unregister(&self, endpoint: &str, channel: u16) {
        if let Some(shared) = self.tunnels.get(endpoint) {
            shared.binds.remove(&channel);
        }
    }

    #[cfg(test)]
    fn active_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    async fn run(
        self: Arc<Self>,
        endpoint: String,
        mut rx: mpsc::Receiver<UdpPacket>,
        binds: BindMap,
    ) {
        let _cleanup = scopeguard::guard(
            (Arc::clone(&self), endpoint.clone()),
            |(tunnel, key)| {
                tunnel.tunnels.remove(&key);
                log::debug!(endpoint = %key, "tunnel record removed");
            },
        );

        let mut last_activity = Instant::now();

        'attempts: for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let ws = match self.dial(&endpoint).await {
                Ok(ws) => ws,
                Err(e) => {
                    log::warn!(endpoint = %endpoint, attempt = attempt, error = %e, "tunnel dial failed");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            };
            log::info!(endpoint = %endpoint, attempt = attempt, "tunnel connected");

            let (mut sink, mut stream) = ws.split();

            loop {
                if last_activity.elapsed() > self.link_idle_timeout {
                    log::info!(endpoint = %endpoint, "tunnel idle, tearing down");
                    break 'attempts;
                }

                tokio::select! {
                    outgoing = rx.recv() => {
                        let Some(packet) = outgoing else {
                            // every sender is gone; nothing left to carry
                            break 'attempts;
                        };
                        let frame = encode_request_frame(&self.client_id, &packet);
                        match tokio::time::timeout(
                            self.write_timeout,
                            sink.send(Message::Binary(frame.into())),
                        )
                        .await
                        {
                            Ok(Ok(())) => last_activity = Instant::now(),
                            Ok(Err(WsError::AlreadyClosed)) => {
                                log::debug!(endpoint = %endpoint, "write on closed tunnel, exiting");
                                break 'attempts;
                            }
                            Ok(Err(e)) => {
                                log::info!(endpoint = %endpoint, error = %e, "tunnel write failed, reconnecting");
                                break;
                            }
                            Err(_) => {
                                log::info!(endpoint = %endpoint, "tunnel write deadline missed, reconnecting");
                                break;
                            }
                        }
                    }
                    incoming = tokio::time::timeout(self.read_timeout, stream.next()) => {
                        match incoming {
                            Err(_) => {
                                // Per-frame deadline: the idle check above
                                // decides whether the next pass tears down.
                                break;
                            }
                            Ok(None) => break,
                            Ok(Some(Ok(Message::Binary(data)))) => {
                                if deliver(&binds, &data) {
                                    last_activity = Instant::now();
                                }
                            }
                            Ok(Some(Ok(Message::Close(frame)))) => {
                                log::info!(
                                    endpoint = %endpoint,
                                    close_code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1005),
                                    "tunnel closed by peer, reconnecting"
                                );
                                break;
                            }
                            Ok(Some(Ok(_))) => {}
                            Ok(Some(Err(WsError::AlreadyClosed))) => {
                                log::debug!(endpoint = %endpoint, "read on closed tunnel, exiting");
                                break 'attempts;
                            }
                            Ok(Some(Err(e))) => {
                                log::info!(endpoint = %endpoint, error = %e, "tunnel read failed, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Route a response frame to its channel's binding. Unknown channels and
/// full queues drop the packet silently — tunnel UDP is best-effort.
fn deliver(binds: &DashMap<u16, mpsc::Sender<UdpPacket>>, data: &[u8]) -> bool {
    let Some(packet) = decode_response_frame(data) else {
        return false;
    };
    if let Some(bind) = binds.get(&packet.channel) {
        let _ = bind.try_send(packet);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::tls::{Fingerprint, TlsPolicy};

    fn test_tunnel() -> Arc<WsTunnel> {
        let dialer = Arc::new(Dialer::new(
            TlsPolicy {
                fingerprint: Fingerprint::Auto,
                padding: None,
            },
            None,
            false,
        ));
        let worker = WorkerPolicy {
            enabled: true,
            sni: "relay.example.workers.dev".to_string(),
            // A dead loopback port: dials fail fast, the backoff keeps the
            // tunnel record alive long enough to observe.
            host: "127.0.0.1:9".to_string(),
            dns_only: false,
        };
        Arc::new(WsTunnel::new(
            dialer,
            worker,
            Duration::from_secs(60),
            Duration::from_secs(60),
            "Abc12-".to_string(),
        ))
    }

    #[test]
    fn test_request_frame_layout() {
        let packet = UdpPacket {
            channel: 7,
            data: Bytes::from_static(b"payload"),
        };
        let frame = encode_request_frame("Abc12-", &packet);
        assert!(frame.len() >= 8);
        assert_eq!(&frame[..6], b"Abc12-");
        assert_eq!(u16::from_be_bytes([frame[6], frame[7]]), 7);
        assert_eq!(&frame[8..], b"payload");
    }

    #[test]
    fn test_response_frame_roundtrip() {
        let packet = UdpPacket {
            channel: 513,
            data: Bytes::from_static(b"reply"),
        };
        let mut wire = packet.channel.to_be_bytes().to_vec();
        wire.extend_from_slice(&packet.data);
        assert_eq!(decode_response_frame(&wire), Some(packet));
    }

    #[test]
    fn test_short_response_frames_skipped() {
        assert_eq!(decode_response_frame(&[]), None);
        assert_eq!(decode_response_frame(&[9]), None);
        assert!(decode_response_frame(&[0, 1]).is_some());
    }

    #[tokio::test]
    async fn test_channel_ids_are_monotone() {
        let tunnel = test_tunnel();
        let endpoint = "wss://relay.example.workers.dev/connect?net=udp";

        let (tx_a, _rx_a) = mpsc::channel(4);
        let (queue_a, channel_a) = tunnel.persistent_dial(endpoint, tx_a);
        let (tx_b, _rx_b) = mpsc::channel(4);
        let (queue_b, channel_b) = tunnel.persistent_dial(endpoint, tx_b);
        let (tx_c, _rx_c) = mpsc::channel(4);
        let (_queue_c, channel_c) = tunnel.persistent_dial(endpoint, tx_c);

        assert_eq!(channel_a, 1);
        assert_eq!(channel_b, 2);
        assert_eq!(channel_c, 3);
        assert!(queue_a.same_channel(&queue_b));
        assert_eq!(tunnel.active_tunnels(), 1);
    }

    #[tokio::test]
    async fn test_deliver_routes_to_matching_channel_only() {
        let binds: DashMap<u16, mpsc::Sender<UdpPacket>> = DashMap::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        binds.insert(1, tx1);
        binds.insert(2, tx2);

        let mut frame = 2u16.to_be_bytes().to_vec();
        frame.extend_from_slice(b"for-two");
        assert!(deliver(&binds, &frame));

        let got = rx2.try_recv().unwrap();
        assert_eq!(got.channel, 2);
        assert_eq!(&got.data[..], b"for-two");
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_drops_unknown_channel() {
        let binds: DashMap<u16, mpsc::Sender<UdpPacket>> = DashMap::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        binds.insert(1, tx1);

        let mut frame = 9u16.to_be_bytes().to_vec();
        frame.extend_from_slice(b"nobody-home");
        assert!(deliver(&binds, &frame));
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_removes_binding() {
        let tunnel = test_tunnel();
        let endpoint = "wss://relay.example.workers.dev/connect?net=udp";
        let (tx, _rx) = mpsc::channel(4);
        let (_queue, channel) = tunnel.persistent_dial(endpoint, tx);

        tunnel.unregister(endpoint, channel);
        let shared = tunnel.tunnels.get(endpoint).unwrap();
        assert!(shared.binds.get(&channel).is_none());
    }
}
