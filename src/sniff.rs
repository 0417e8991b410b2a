//! First-packet inspection.
//!
//! Extracts the destination hostname from the opening bytes of a session:
//! the SNI of a TLS ClientHello, or the `Host:` header of a plain HTTP
//! request. HTTP requests are additionally rewritten so the literal
//! `Host:` token becomes `hOSt:` — header names are case-insensitive per
//! RFC 7230, so origin servers accept it while naive middlebox matchers
//! miss it.

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const TLS_RECORD_HEADER_SIZE: usize = 5;
const TLS_HANDSHAKE_HEADER_SIZE: usize = 4;

const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_NAME_TYPE_HOSTNAME: u8 = 0x00;

/// Result of inspecting a first packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspected {
    /// Extracted hostname, if any was found
    pub hostname: Option<Vec<u8>>,
    /// Bytes to forward: identical to the input except for the HTTP
    /// `Host:` case rewrite
    pub data: Vec<u8>,
    /// True when the packet parsed as a plain HTTP request
    pub is_http: bool,
}

/// Inspect a first packet: TLS ClientHello first, then HTTP, then give up.
pub fn inspect(data: &[u8]) -> Inspected {
    if let Some(sni) = client_hello_sni(data) {
        return Inspected {
            hostname: Some(sni),
            data: data.to_vec(),
            is_http: false,
        };
    }
    if let Some((host, rewritten)) = parse_http_host(data) {
        return Inspected {
            hostname: Some(host),
            data: rewritten,
            is_http: true,
        };
    }
    Inspected {
        hostname: None,
        data: data.to_vec(),
        is_http: false,
    }
}

/// Extract the SNI hostname from a TLS ClientHello.
///
/// The structured extension walker runs first; if the hello is malformed in
/// a way the walker cannot traverse, a raw byte scan for the server_name
/// extension pattern is tried before giving up.
pub fn client_hello_sni(data: &[u8]) -> Option<Vec<u8>> {
    walk_client_hello(data).or_else(|| scan_for_sni(data))
}

fn walk_client_hello(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < TLS_RECORD_HEADER_SIZE + TLS_HANDSHAKE_HEADER_SIZE {
        return None;
    }
    if data[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    // Record-layer version 0x03XX for SSL3.0 through TLS1.3
    if data[1] != 0x03 {
        return None;
    }
    if data[TLS_RECORD_HEADER_SIZE] != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }

    // record header (5) + handshake header (4) + client_version (2) + random (32)
    let mut pos = TLS_RECORD_HEADER_SIZE + TLS_HANDSHAKE_HEADER_SIZE + 2 + 32;

    // session_id
    if pos >= data.len() {
        return None;
    }
    let session_id_len = data[pos] as usize;
    pos += 1 + session_id_len;

    // cipher_suites
    if pos + 2 > data.len() {
        return None;
    }
    let cipher_suites_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    // compression_methods
    if pos >= data.len() {
        return None;
    }
    let compression_len = data[pos] as usize;
    pos += 1 + compression_len;

    // extensions
    if pos + 2 > data.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(data.len());

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > data.len() {
            return None;
        }
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_sni_extension(&data[pos..pos + ext_len]);
        }
        pos += ext_len;
    }

    None
}

fn parse_sni_extension(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 5 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let mut pos = 2;
    let end = (2 + list_len).min(data.len());

    while pos + 3 <= end {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > data.len() {
            return None;
        }
        if name_type == SNI_NAME_TYPE_HOSTNAME {
            let name = &data[pos..pos + name_len];
            if !name.is_empty() && name.iter().all(|b| is_hostname_byte(*b)) {
                return Some(name.to_vec());
            }
        }
        pos += name_len;
    }

    None
}

/// Raw scan for the server_name extension byte pattern.
///
/// Matches `00 00 <el> <ll> 00 <nl> <hostname>` where the three length
/// fields are mutually consistent and the hostname bytes form a plausible
/// DNS name. Used only when the structured walker fails.
fn scan_for_sni(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() || data[0] != TLS_CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    for i in 0..data.len().saturating_sub(9) {
        if data[i] != 0x00 || data[i + 1] != 0x00 {
            continue;
        }
        let ext_len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        let list_len = u16::from_be_bytes([data[i + 4], data[i + 5]]) as usize;
        let name_type = data[i + 6];
        let name_len = u16::from_be_bytes([data[i + 7], data[i + 8]]) as usize;
        if name_type != SNI_NAME_TYPE_HOSTNAME
            || ext_len != list_len + 2
            || list_len != name_len + 3
            || name_len == 0
        {
            continue;
        }
        let start = i + 9;
        if start + name_len > data.len() {
            continue;
        }
        let name = &data[start..start + name_len];
        if name.contains(&b'.') && name.iter().all(|b| is_hostname_byte(*b)) {
            return Some(name.to_vec());
        }
    }
    None
}

fn is_hostname_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_'
}

/// Parse the head of an HTTP request and rewrite its `Host:` token.
///
/// Returns the hostname (port stripped) and the rewritten packet. The
/// request head must be complete (terminated by an empty line).
pub fn parse_http_host(data: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let head_end = find_subsequence(data, b"\r\n\r\n")?;
    let head = &data[..head_end];
    let mut lines = head.split(|b| *b == b'\n');

    // request line: METHOD TARGET HTTP/x.y
    let request_line = lines.next()?;
    let request_line = std::str::from_utf8(request_line).ok()?.trim_end_matches('\r');
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let _target = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }

    let mut host: Option<Vec<u8>> = None;
    for line in lines {
        let line = std::str::from_utf8(line).ok()?.trim_end_matches('\r');
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("host") {
                let value = value.trim();
                let bare = value.rsplit_once(':').map_or(value, |(h, p)| {
                    if p.bytes().all(|b| b.is_ascii_digit()) {
                        h
                    } else {
                        value
                    }
                });
                host = Some(bare.as_bytes().to_vec());
                break;
            }
        }
    }
    let host = host?;

    let rewritten = replace_all(data, b"Host:", b"hOSt:");
    Some((host, rewritten))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn replace_all(data: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    debug_assert_eq!(from.len(), to.len());
    let mut out = data.to_vec();
    let mut start = 0;
    while let Some(pos) = find_subsequence(&out[start..], from) {
        let at = start + pos;
        out[at..at + to.len()].copy_from_slice(to);
        start = at + to.len();
    }
    out
}
