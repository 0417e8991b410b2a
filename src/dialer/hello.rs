//! Custom ClientHello wire codec.
//!
//! Builds the padded hello used when TLS padding is enabled: a fixed
//! cipher-suite ordering with the GREASE placeholder in the first slot and
//! a fixed extension sequence ending in a padding extension (type 0x15)
//! filled with random bytes, followed by the server_name extension.
//! Middlebox classifiers key on cipher and extension ordering, so the
//! layout here is part of the wire contract, not an implementation detail.

use rand::rngs::OsRng;
use rand::RngCore;

pub const GREASE_PLACEHOLDER: u16 = 0x0a0a;

pub const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
pub const EXT_EC_POINT_FORMATS: u16 = 0x000b;
pub const EXT_SESSION_TICKET: u16 = 0x0023;
pub const EXT_ALPN: u16 = 0x0010;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
pub const EXT_KEY_SHARE: u16 = 0x0033;
pub const EXT_PSK_KEY_EXCHANGE_MODES: u16 = 0x002d;
pub const EXT_PADDING: u16 = 0x0015;
pub const EXT_SERVER_NAME: u16 = 0x0000;

const CURVE_X25519: u16 = 0x001d;
const CURVE_P256: u16 = 0x0017;

/// Cipher ordering of the padded hello. GREASE first, a mixed
/// ECDSA/RSA + TLS 1.3 ladder after it.
pub const PADDED_CIPHER_SUITES: [u16; 9] = [
    GREASE_PLACEHOLDER,
    0xcca9, // ECDHE-ECDSA-CHACHA20-POLY1305
    0xc02b, // ECDHE-ECDSA-AES128-GCM-SHA256
    0xc00a, // ECDHE-ECDSA-AES256-CBC-SHA
    0xc013, // ECDHE-RSA-AES128-CBC-SHA
    0x1301, // TLS13 AES128-GCM-SHA256
    0x0039, // DHE-RSA-AES256-CBC-SHA
    0xc02f, // ECDHE-RSA-AES128-GCM-SHA256
    0x0035, // RSA-AES256-CBC-SHA
];

/// Signature schemes offered, in order.
pub const SIGNATURE_SCHEMES: [u16; 11] = [
    0x0403, // ecdsa_secp256r1_sha256
    0x0503, // ecdsa_secp384r1_sha384
    0x0603, // ecdsa_secp521r1_sha512
    0x0804, // rsa_pss_rsae_sha256
    0x0805, // rsa_pss_rsae_sha384
    0x0806, // rsa_pss_rsae_sha512
    0x0401, // rsa_pkcs1_sha256
    0x0501, // rsa_pkcs1_sha384
    0x0601, // rsa_pkcs1_sha512
    0x0203, // ecdsa_sha1
    0x0201, // rsa_pkcs1_sha1
];

/// Normalize a dial target into an SNI value.
///
/// Literal IPs, bracketed literals, zone suffixes, and absolute FQDNs are
/// not permitted as server_name values (RFC 6066 §3); those yield an empty
/// name and the extension is omitted.
pub fn hostname_in_sni(name: &str) -> String {
    let mut host = name;
    if host.len() > 1 && host.starts_with('[') && host.ends_with(']') {
        host = &host[1..host.len() - 1];
    }
    if let Some(i) = host.rfind('%') {
        if i > 0 {
            host = &host[..i];
        }
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return String::new();
    }
    name.trim_end_matches('.').to_string()
}

/// The padded hello layout, ready to encode.
#[derive(Debug, Clone)]
pub struct ClientHelloSpec {
    pub server_name: String,
    pub padding_len: u16,
}

impl ClientHelloSpec {
    pub fn padded(server_name: &str, padding_len: u16) -> Self {
        Self {
            server_name: server_name.to_string(),
            padding_len,
        }
    }

    /// Extension type sequence this spec will emit, in order.
    pub fn extension_order(&self) -> Vec<u16> {
        let mut order = vec![
            EXT_SUPPORTED_GROUPS,
            EXT_EC_POINT_FORMATS,
            EXT_SESSION_TICKET,
            EXT_ALPN,
            EXT_SIGNATURE_ALGORITHMS,
            EXT_KEY_SHARE,
            EXT_PSK_KEY_EXCHANGE_MODES,
            EXT_PADDING,
        ];
        if !hostname_in_sni(&self.server_name).is_empty() {
            order.push(EXT_SERVER_NAME);
        }
        order
    }

    /// Serialize the full TLS record carrying this hello.
    pub fn encode(&self) -> Vec<u8> {
        let mut extensions = Vec::new();

        // supported_groups
        push_extension(&mut extensions, EXT_SUPPORTED_GROUPS, &{
            let mut body = Vec::new();
            body.extend_from_slice(&4u16.to_be_bytes());
            body.extend_from_slice(&CURVE_X25519.to_be_bytes());
            body.extend_from_slice(&CURVE_P256.to_be_bytes());
            body
        });

        // ec_point_formats: uncompressed only
        push_extension(&mut extensions, EXT_EC_POINT_FORMATS, &[0x01, 0x00]);

        // session_ticket: empty
        push_extension(&mut extensions, EXT_SESSION_TICKET, &[]);

        // ALPN: http/1.1 only
        push_extension(&mut extensions, EXT_ALPN, &{
            let mut body = Vec::new();
            body.extend_from_slice(&9u16.to_be_bytes());
            body.push(8);
            body.extend_from_slice(b"http/1.1");
            body
        });

        // signature_algorithms
        push_extension(&mut extensions, EXT_SIGNATURE_ALGORITHMS, &{
            let mut body = Vec::new();
            body.extend_from_slice(&((SIGNATURE_SCHEMES.len() * 2) as u16).to_be_bytes());
            for scheme in SIGNATURE_SCHEMES {
                body.extend_from_slice(&scheme.to_be_bytes());
            }
            body
        });

        // key_share: GREASE stub + X25519 share
        push_extension(&mut extensions, EXT_KEY_SHARE, &{
            let mut x25519_key = [0u8; 32];
            OsRng.fill_bytes(&mut x25519_key);

            let mut shares = Vec::new();
            shares.extend_from_slice(&GREASE_PLACEHOLDER.to_be_bytes());
            shares.extend_from_slice(&1u16.to_be_bytes());
            shares.push(0x00);
            shares.extend_from_slice(&CURVE_X25519.to_be_bytes());
            shares.extend_from_slice(&32u16.to_be_bytes());
            shares.extend_from_slice(&x25519_key);

            let mut body = Vec::new();
            body.extend_from_slice(&(shares.len() as u16).to_be_bytes());
            body.extend_from_slice(&shares);
            body
        });

        // psk_key_exchange_modes: DHE
        push_extension(&mut extensions, EXT_PSK_KEY_EXCHANGE_MODES, &[0x01, 0x01]);

        // padding: random filler
        let mut pad = vec![0u8; self.padding_len as usize];
        OsRng.fill_bytes(&mut pad);
        push_extension(&mut extensions, EXT_PADDING, &pad);

        // server_name last
        let host = hostname_in_sni(&self.server_name);
        if !host.is_empty() {
            push_extension(&mut extensions, EXT_SERVER_NAME, &{
                let mut body = Vec::new();
                body.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
                body.push(0x00);
                body.extend_from_slice(&(host.len() as u16).to_be_bytes());
                body.extend_from_slice(host.as_bytes());
                body
            });
        }

        let mut hello = Vec::new();
        // client_version TLS 1.2 (1.3 negotiates via extensions)
        hello.extend_from_slice(&[0x03, 0x03]);
        let mut random = [0u8; 32];
        OsRng.fill_bytes(&mut random);
        hello.extend_from_slice(&random);
        // empty session_id
        hello.push(0x00);
        hello.extend_from_slice(&((PADDED_CIPHER_SUITES.len() * 2) as u16).to_be_bytes());
        for suite in PADDED_CIPHER_SUITES {
            hello.extend_from_slice(&suite.to_be_bytes());
        }
        // null compression only
        hello.extend_from_slice(&[0x01, 0x00]);
        hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01);
        let len = hello.len();
        handshake.push((len >> 16) as u8);
        handshake.push((len >> 8) as u8);
        handshake.push(len as u8);
        handshake.extend_from_slice(&hello);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }
}

fn push_extension(out: &mut Vec<u8>, ext_type: u16, body: &[u8]) {
    out.extend_from_slice(&ext_type.to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}
