use std::io;
use thiserror::Error;

use crate::socks::statute;

/// Unified error type for the proxy engine.
///
/// Every session-level failure carries enough structure to pick the SOCKS
/// reply code without inspecting error message text.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected protocol bytes from the client
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SOCKS command we do not implement
    #[error("command {0} not supported")]
    CommandNotSupported(u8),

    /// Unrecognized ATYP in a SOCKS request
    #[error("address type {0} not supported")]
    AddrTypeNotSupported(u8),

    /// Client offered no acceptable authentication method
    #[error("no acceptable authentication method")]
    MethodNotAcceptable,

    /// Name resolution failure (DNS error, empty answer, dead CNAME chain)
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// Destination actively refused the connection
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// No route to the destination network
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Destination host is unreachable
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    /// Worker tunnel failure (dial, handshake, endpoint construction)
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// SOCKS5 reply code matching this error.
    pub fn reply_code(&self) -> u8 {
        match self {
            ProxyError::CommandNotSupported(_) => statute::REP_COMMAND_NOT_SUPPORTED,
            ProxyError::AddrTypeNotSupported(_) => statute::REP_ADDR_TYPE_NOT_SUPPORTED,
            ProxyError::Resolution(_) | ProxyError::HostUnreachable(_) => {
                statute::REP_HOST_UNREACHABLE
            }
            ProxyError::ConnectionRefused(_) => statute::REP_CONNECTION_REFUSED,
            ProxyError::NetworkUnreachable(_) => statute::REP_NETWORK_UNREACHABLE,
            _ => statute::REP_SERVER_FAILURE,
        }
    }

    /// Classify an outbound connect failure by its io::ErrorKind.
    ///
    /// The kind carries the routing-relevant distinction; falling back to
    /// HostUnreachable keeps the client-visible semantics of a dead dial.
    pub fn from_connect(target: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => {
                ProxyError::ConnectionRefused(format!("{target}: {err}"))
            }
            io::ErrorKind::NetworkUnreachable => {
                ProxyError::NetworkUnreachable(format!("{target}: {err}"))
            }
            io::ErrorKind::HostUnreachable | io::ErrorKind::TimedOut => {
                ProxyError::HostUnreachable(format!("{target}: {err}"))
            }
            _ => ProxyError::Io(err),
        }
    }
}
