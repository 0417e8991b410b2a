//! DNS-over-HTTPS client (RFC 8484, GET binding).
//!
//! The query is packed to wire format with its ID zeroed (cache-friendly
//! per the RFC), base64url-encoded without padding, and sent as
//! `GET {path}?dns=...` over a connection produced by our own dialer —
//! so DoH traffic itself is fragmented and fingerprint-shaped. The
//! original ID is restored on the response.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use hickory_proto::op::Message;
use http::header;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use url::Url;

use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::logger::log;

const DOH_CONTENT_TYPE: &str = "application/dns-message";
const DOH_QUERY_TIMEOUT_SECS: u64 = 10;

pub struct DohClient {
    dialer: Arc<Dialer>,
}

impl DohClient {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        Self { dialer }
    }

    /// Encode a query for the `dns=` parameter.
    pub fn encode_query(query: &Message) -> Result<String, ProxyError> {
        let mut wire = query.clone();
        wire.set_id(0);
        let packed = wire
            .to_vec()
            .map_err(|e| ProxyError::Resolution(format!("failed to pack query: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(packed))
    }

    /// Exchange one query with the server at `url`, dialed at
    /// `connect_addr` with TLS name `sni`.
    pub async fn exchange(
        &self,
        query: &Message,
        url: &Url,
        connect_addr: &str,
        sni: &str,
    ) -> Result<Message, ProxyError> {
        let original_id = query.id();
        let encoded = Self::encode_query(query)?;

        let stream = self
            .dialer
            .tls_dial(connect_addr, sni)
            .await
            .map_err(|e| ProxyError::Resolution(format!("DoH dial {connect_addr}: {e}")))?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(io)
                .await
                .map_err(|e| ProxyError::Resolution(format!("DoH handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                log::debug!(error = %e, "DoH connection closed");
            }
        });

        let host_header = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or(sni), port),
            None => url.host_str().unwrap_or(sni).to_string(),
        };
        let request = http::Request::builder()
            .method(http::Method::GET)
            .uri(format!("{}?dns={}", url.path(), encoded))
            .header(header::HOST, host_header)
            .header(header::ACCEPT, DOH_CONTENT_TYPE)
            .body(Empty::new())
            .map_err(|e| ProxyError::Resolution(format!("DoH request build: {e}")))?;

        let response = tokio::time::timeout(
            Duration::from_secs(DOH_QUERY_TIMEOUT_SECS),
            sender.send_request(request),
        )
        .await
        .map_err(|_| ProxyError::Resolution("DoH query timed out".into()))?
        .map_err(|e| ProxyError::Resolution(format!("DoH request: {e}")))?;

        if response.status() != http::StatusCode::OK {
            return Err(ProxyError::Resolution(format!(
                "DoH server answered {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(DOH_CONTENT_TYPE) {
            return Err(ProxyError::Resolution(format!(
                "unexpected DoH media type {content_type}"
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::Resolution(format!("DoH body: {e}")))?
            .to_bytes();

        let mut answer = Message::from_vec(&body)
            .map_err(|e| ProxyError::Resolution(format!("failed to unpack answer: {e}")))?;
        answer.set_id(original_id);
        Ok(answer)
    }
}
