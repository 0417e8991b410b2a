//! TLS client dialer with browser-shaped handshakes.
//!
//! Each fingerprint tag maps onto a rustls profile: cipher-suite ordering,
//! ALPN with `h2` removed (HTTP/1.1 keeps downstream framing simple), and
//! session-ticket behavior. `auto` picks uniformly from the modern set per
//! dial. When padding is enabled, the profile is derived from the padded
//! hello spec instead, so the emitted hello tracks that cipher ordering.
//!
//! Certificate verification is disabled: the operator already trusts the
//! worker endpoint, and certificate chains on censored paths are routinely
//! substituted mid-flight.

use std::io;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rustls::client::Resumption;
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::ServerName;
use rustls::{CipherSuite, ClientConfig, SupportedCipherSuite};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;

use super::hello::{ClientHelloSpec, PADDED_CIPHER_SUITES};
use crate::config::TlsSection;
use crate::logger::log;

/// Mimicked client fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprint {
    Chrome,
    Edge,
    Firefox,
    Safari,
    Ios,
    Android,
    Auto,
}

const MODERN_SET: [Fingerprint; 6] = [
    Fingerprint::Chrome,
    Fingerprint::Edge,
    Fingerprint::Firefox,
    Fingerprint::Safari,
    Fingerprint::Ios,
    Fingerprint::Android,
];

impl Fingerprint {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "chrome" => Some(Fingerprint::Chrome),
            "edge" => Some(Fingerprint::Edge),
            "firefox" => Some(Fingerprint::Firefox),
            "safari" => Some(Fingerprint::Safari),
            "ios" => Some(Fingerprint::Ios),
            "android" => Some(Fingerprint::Android),
            "auto" => Some(Fingerprint::Auto),
            _ => None,
        }
    }

    /// Resolve `auto` to a concrete fingerprint.
    pub fn concrete(self) -> Fingerprint {
        match self {
            Fingerprint::Auto => MODERN_SET[rand::thread_rng().gen_range(0..MODERN_SET.len())],
            other => other,
        }
    }

    fn cipher_preference(self) -> &'static [CipherSuite] {
        use CipherSuite::*;
        match self {
            Fingerprint::Chrome | Fingerprint::Edge | Fingerprint::Android => &[
                TLS13_AES_128_GCM_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
            Fingerprint::Firefox => &[
                TLS13_AES_128_GCM_SHA256,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ],
            Fingerprint::Safari | Fingerprint::Ios => &[
                TLS13_AES_128_GCM_SHA256,
                TLS13_AES_256_GCM_SHA384,
                TLS13_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            ],
            Fingerprint::Auto => &[],
        }
    }

    /// OkHttp disables TLS session tickets; the browsers keep them.
    fn session_tickets(self) -> bool {
        !matches!(self, Fingerprint::Android)
    }
}

/// TLS dialing policy derived from config.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    pub fingerprint: Fingerprint,
    /// Inclusive padding extension length range when padding is enabled
    pub padding: Option<(u16, u16)>,
}

impl TlsPolicy {
    pub fn from_config(tls: &TlsSection) -> Self {
        let fingerprint = Fingerprint::parse(&tls.fingerprint).unwrap_or(Fingerprint::Auto);
        let padding = if tls.padding.enabled {
            Some((tls.padding.length[0], tls.padding.length[1]))
        } else {
            None
        };
        Self {
            fingerprint,
            padding,
        }
    }
}

/// Draw a padding length uniformly from the inclusive range.
pub fn draw_padding_len(range: (u16, u16)) -> u16 {
    let (min, max) = range;
    if max > min {
        let span = (max - min + 1) as u32;
        min + (OsRng.next_u32() % span) as u16
    } else {
        min
    }
}

#[derive(Debug)]
struct InsecureVerifier {
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

/// Dials TLS with a fingerprint-shaped client configuration.
pub struct TlsDialer {
    policy: TlsPolicy,
}

impl TlsDialer {
    pub fn new(policy: TlsPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &TlsPolicy {
        &self.policy
    }

    /// Build the client config for one dial.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        match self.policy.padding {
            Some(range) => {
                let padding_len = draw_padding_len(range);
                // ClientHelloSpec owns the padded hello's wire layout; here
                // it pins the cipher ordering the handshake offers.
                let spec = ClientHelloSpec::padded("", padding_len);
                log::debug!(
                    padding_len = padding_len,
                    extensions = spec.extension_order().len(),
                    "using padded hello profile"
                );
                let preference: Vec<CipherSuite> = PADDED_CIPHER_SUITES
                    .iter()
                    .map(|id| CipherSuite::from(*id))
                    .collect();
                build_config(&preference, true)
            }
            None => {
                let fingerprint = self.policy.fingerprint.concrete();
                build_config(fingerprint.cipher_preference(), fingerprint.session_tickets())
            }
        }
    }

    /// Run the TLS handshake over an established stream.
    pub async fn connect<S>(
        &self,
        stream: S,
        sni: &str,
    ) -> io::Result<tokio_rustls::client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = ServerName::try_from(sni.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let connector = TlsConnector::from(self.client_config());
        connector.connect(server_name, stream).await
    }
}

fn build_config(preference: &[CipherSuite], session_tickets: bool) -> Arc<ClientConfig> {
    let mut provider = aws_lc_rs::default_provider();
    provider.cipher_suites = order_suites(&provider.cipher_suites, preference);
    let supported_algs = provider.signature_verification_algorithms;

    let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .expect("TLS 1.2/1.3 are supported by the provider")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier { supported_algs }))
        .with_no_client_auth();

    // h2 stays out of the ALPN list on purpose.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config.resumption = if session_tickets {
        Resumption::in_memory_sessions(128)
    } else {
        Resumption::disabled()
    };

    Arc::new(config)
}

/// Reorder the provider's suites by the preference list; suites the
/// provider supports but the preference does not mention keep their
/// original relative order at the tail.
fn order_suites(
    available: &[SupportedCipherSuite],
    preference: &[CipherSuite],
) -> Vec<SupportedCipherSuite> {
    let mut ordered: Vec<SupportedCipherSuite> = Vec::with_capacity(available.len());
    for wanted in preference {
        if let Some(suite) = available.iter().find(|s| s.suite() == *wanted) {
            ordered.push(*suite);
        }
    }
    for suite in available {
        if !ordered.iter().any(|s| s.suite() == suite.suite()) {
            ordered.push(*suite);
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PaddingSection, TlsSection};

    #[test]
    fn test_fingerprint_parse() {
        assert_eq!(Fingerprint::parse("chrome"), Some(Fingerprint::Chrome));
        assert_eq!(Fingerprint::parse("auto"), Some(Fingerprint::Auto));
        assert_eq!(Fingerprint::parse("netscape"), None);
    }

    #[test]
    fn test_auto_resolves_to_modern_set() {
        for _ in 0..32 {
            let fp = Fingerprint::Auto.concrete();
            assert!(MODERN_SET.contains(&fp));
            assert_ne!(fp, Fingerprint::Auto);
        }
    }

    #[test]
    fn test_concrete_is_identity_for_fixed() {
        assert_eq!(Fingerprint::Firefox.concrete(), Fingerprint::Firefox);
    }

    #[test]
    fn test_alpn_has_no_h2() {
        let dialer = TlsDialer::new(TlsPolicy {
            fingerprint: Fingerprint::Chrome,
            padding: None,
        });
        let config = dialer.client_config();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_cipher_ordering_applied() {
        let dialer = TlsDialer::new(TlsPolicy {
            fingerprint: Fingerprint::Firefox,
            padding: None,
        });
        let config = dialer.client_config();
        let suites = &config.crypto_provider().cipher_suites;
        assert_eq!(suites[0].suite(), CipherSuite::TLS13_AES_128_GCM_SHA256);
        assert_eq!(
            suites[1].suite(),
            CipherSuite::TLS13_CHACHA20_POLY1305_SHA256
        );
    }

    #[test]
    fn test_ordering_keeps_all_supported_suites() {
        let provider = aws_lc_rs::default_provider();
        let ordered = order_suites(
            &provider.cipher_suites,
            Fingerprint::Safari.cipher_preference(),
        );
        assert_eq!(ordered.len(), provider.cipher_suites.len());
    }

    #[test]
    fn test_draw_padding_len_in_range() {
        for _ in 0..64 {
            let n = draw_padding_len((10, 90));
            assert!((10..=90).contains(&n));
        }
        assert_eq!(draw_padding_len((7, 7)), 7);
    }

    #[test]
    fn test_policy_from_config() {
        let section = TlsSection {
            fingerprint: "ios".to_string(),
            padding: PaddingSection {
                enabled: true,
                length: [5, 50],
            },
        };
        let policy = TlsPolicy::from_config(&section);
        assert_eq!(policy.fingerprint, Fingerprint::Ios);
        assert_eq!(policy.padding, Some((5, 50)));
    }

    #[test]
    fn test_padded_config_builds() {
        let dialer = TlsDialer::new(TlsPolicy {
            fingerprint: Fingerprint::Auto,
            padding: Some((1, 32)),
        });
        let config = dialer.client_config();
        assert!(!config.crypto_provider().cipher_suites.is_empty());
    }
}
