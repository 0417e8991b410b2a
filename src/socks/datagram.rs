//! SOCKS5 UDP datagram codec (RFC 1928 §7).
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | variable |    2     | variable |
//! +-----+------+------+----------+----------+----------+
//! ```
//!
//! Fragmented datagrams (FRAG != 0) are not supported and are rejected so
//! callers can drop them.

use bytes::Bytes;

use crate::address::{Address, DecodeResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub dst: Address,
    pub data: Bytes,
}

impl Datagram {
    pub fn new(dst: Address, data: Bytes) -> Self {
        Self { dst, data }
    }

    /// Decode a datagram from a single UDP packet.
    pub fn decode(buf: &[u8]) -> Result<Datagram, &'static str> {
        if buf.len() < 4 {
            return Err("datagram too short");
        }
        if buf[0] != 0 || buf[1] != 0 {
            return Err("reserved bytes must be zero");
        }
        if buf[2] != 0 {
            return Err("fragmented datagram");
        }
        let (dst, consumed) = match Address::decode(&buf[3..]) {
            DecodeResult::Ok(addr, n) => (addr, n),
            DecodeResult::NeedMoreData => return Err("truncated address"),
            DecodeResult::Invalid(msg) => return Err(msg),
        };
        let data = Bytes::copy_from_slice(&buf[3 + consumed..]);
        Ok(Datagram { dst, data })
    }

    /// Header bytes for this datagram's destination.
    pub fn header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.dst.encoded_size());
        out.extend_from_slice(&[0x00, 0x00, 0x00]);
        self.dst.encode(&mut out);
        out
    }

    /// Full wire bytes: header followed by payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header();
        out.extend_from_slice(&self.data);
        out
    }
}
