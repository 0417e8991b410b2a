//! Outbound dialing.
//!
//! All outbound TCP leaves through this module so NODELAY, connect
//! timeouts, socket protection intent, and first-packet fragmentation are
//! applied uniformly — including to the engine's own TLS handshakes
//! (worker tunnel, DoH), whose ClientHellos get split around their SNI
//! just like client traffic.

pub mod hello;
pub mod tls;

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::fragment::{FragmentPolicy, FragmentStream};
use crate::logger::log;
use crate::transport::TransportStream;
use tls::{TlsDialer, TlsPolicy};

const TCP_CONNECT_TIMEOUT_SECS: u64 = 10;

pub struct Dialer {
    tls: TlsDialer,
    fragment: Option<FragmentPolicy>,
    protect: bool,
}

impl Dialer {
    pub fn new(tls_policy: TlsPolicy, fragment: Option<FragmentPolicy>, protect: bool) -> Self {
        Self {
            tls: TlsDialer::new(tls_policy),
            fragment,
            protect,
        }
    }

    pub fn fragment_policy(&self) -> Option<FragmentPolicy> {
        self.fragment
    }

    /// Open a TCP connection with NODELAY set.
    pub async fn tcp_dial(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(
            Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect {addr} timed out")))??;

        stream.set_nodelay(true)?;
        if self.protect {
            // Socket marking for VPN exemption is applied by the platform
            // wrapper; the engine records the intent for diagnosis.
            log::debug!(addr = addr, "outbound socket flagged as protected");
        }
        Ok(stream)
    }

    /// TCP connection whose first write is fragmented when the policy says so.
    pub async fn fragment_dial(&self, addr: &str) -> io::Result<TransportStream> {
        let stream = self.tcp_dial(addr).await?;
        Ok(match self.fragment {
            Some(policy) => Box::pin(FragmentStream::new(stream, policy)),
            None => Box::pin(stream),
        })
    }

    /// Full evasive dial: fragmented TCP underlay, fingerprint-shaped TLS.
    pub async fn tls_dial(&self, addr: &str, sni: &str) -> io::Result<TransportStream> {
        let stream = self.fragment_dial(addr).await?;
        let tls_stream = self.tls.connect(stream, sni).await?;
        Ok(Box::pin(tls_stream))
    }
}
