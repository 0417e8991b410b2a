//! SOCKS front door: protocol statute, UDP datagram codec, the
//! multi-protocol listener, and the internal HTTP proxy it chains to.

pub mod datagram;
pub mod http;
pub mod server;
pub mod statute;

pub use server::ProxyFrontend;
