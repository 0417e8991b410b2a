//! Local anti-DPI proxy engine.
//!
//! Architecture:
//! - `socks/`: multi-protocol front door (SOCKS5, SOCKS4/4a, HTTP) and codecs
//! - `sniff` + `fragment`: first-packet inspection and split-and-pace writer
//! - `dialer/`: outbound TCP/TLS with browser-shaped handshakes
//! - `resolve/`: DoH resolution with hosts override, caching, CNAME chasing
//! - `transport/`: WebSocket worker tunnel with UDP channel multiplexing
//! - `handler`: per-session orchestration between the two evasion paths

pub mod address;
pub mod config;
pub mod dialer;
pub mod error;
pub mod fragment;
pub mod handler;
pub mod logger;
pub mod pool;
pub mod relay;
pub mod resolve;
pub mod sniff;
pub mod socks;
pub mod transport;
