//! Destination name resolution.
//!
//! Resolution order for a queried name:
//!
//! 1. Worker override — the worker's own hostname maps to the operator's
//!    pre-selected worker IP, never to public DNS.
//! 2. Config-supplied hosts table (exact match).
//! 3. Self-referential guard — a query for the DoH server's own hostname
//!    goes to the system resolver so bootstrap cannot deadlock.
//! 4. Session cache, keyed by the name with a trailing dot.
//! 5. Upstream query (DoH or system), chasing CNAMEs.

pub mod cache;
pub mod doh;

use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use url::Url;

use crate::config::{DnsSection, HostEntry, WorkerPolicy};
use crate::dialer::Dialer;
use crate::error::ProxyError;
use crate::logger::log;
use cache::DnsCache;
use doh::DohClient;

const MAX_CNAME_HOPS: usize = 8;

pub struct Resolver {
    kind: String,
    address: String,
    hosts: Vec<HostEntry>,
    worker: WorkerPolicy,
    cache: DnsCache,
    doh: DohClient,
}

impl Resolver {
    pub fn new(dns: &DnsSection, worker: WorkerPolicy, dialer: Arc<Dialer>) -> Self {
        Self {
            kind: dns.kind.clone(),
            address: dns.address.clone(),
            hosts: dns.hosts.clone(),
            worker,
            cache: DnsCache::new(Duration::from_secs(dns.ttl)),
            doh: DohClient::new(dialer),
        }
    }

    /// Resolve a name to an IP string.
    pub async fn resolve(&self, fqdn: &str) -> Result<String, ProxyError> {
        let mut current = fqdn.trim().trim_end_matches('.').to_string();
        if current.is_empty() {
            return Err(ProxyError::Resolution("empty name".into()));
        }

        // Names whose answers arrive via CNAME hops; all of them get the
        // final address cached under their own key.
        let mut chain: Vec<String> = Vec::new();

        for _ in 0..MAX_CNAME_HOPS {
            if let Some(ip) = self.worker_override(&current) {
                return Ok(ip);
            }
            if let Some(ip) = self.check_hosts(&current) {
                log::resolution(&current, &ip, false);
                return Ok(ip);
            }
            if self.is_self_referential(&current) {
                let ip = system_lookup(&current).await?;
                log::resolution(&current, &ip, false);
                return Ok(ip);
            }

            let key = format!("{current}.");
            if let Some(ip) = self.cache.get(&key) {
                log::resolution(&current, &ip, true);
                self.cache_chain(&chain, &ip);
                return Ok(ip);
            }
            chain.push(current.clone());

            if self.kind != "doh" {
                let ip = system_lookup(&current).await?;
                log::resolution(&current, &ip, false);
                self.cache_chain(&chain, &ip);
                return Ok(ip);
            }

            let answer = self.doh_query(&key).await?;
            let records = answer.answers();
            if records.is_empty() {
                return Err(ProxyError::Resolution(format!("no answer for {current}")));
            }
            match records[0].data() {
                Some(RData::A(a)) => {
                    let ip = a.0.to_string();
                    log::resolution(&current, &ip, false);
                    self.cache_chain(&chain, &ip);
                    return Ok(ip);
                }
                Some(RData::AAAA(aaaa)) => {
                    let ip = aaaa.0.to_string();
                    log::resolution(&current, &ip, false);
                    self.cache_chain(&chain, &ip);
                    return Ok(ip);
                }
                Some(RData::CNAME(cname)) => {
                    current = cname.0.to_ascii().trim_end_matches('.').to_string();
                }
                other => {
                    return Err(ProxyError::Resolution(format!(
                        "unusable record {other:?} for {current}"
                    )));
                }
            }
        }

        Err(ProxyError::Resolution(format!(
            "CNAME chain for {fqdn} exceeded {MAX_CNAME_HOPS} hops"
        )))
    }

    fn cache_chain(&self, chain: &[String], ip: &str) {
        for name in chain {
            self.cache.set(format!("{name}."), ip.to_string());
        }
    }

    fn worker_override(&self, fqdn: &str) -> Option<String> {
        if !self.worker.enabled || fqdn.is_empty() || !self.worker.sni.contains(fqdn) {
            return None;
        }
        let host = match self.worker.host.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
            _ => self.worker.host.as_str(),
        };
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.contains(':') {
            Some(format!("[{host}]"))
        } else {
            Some(host.to_string())
        }
    }

    fn check_hosts(&self, fqdn: &str) -> Option<String> {
        self.hosts
            .iter()
            .find(|entry| entry.domain == fqdn)
            .map(|entry| entry.ip.clone())
    }

    fn is_self_referential(&self, fqdn: &str) -> bool {
        self.kind == "doh"
            && Url::parse(&self.address)
                .ok()
                .and_then(|u| u.host_str().map(|h| h == fqdn))
                .unwrap_or(false)
    }

    async fn doh_query(&self, key: &str) -> Result<Message, ProxyError> {
        let mut query = Message::new();
        query
            .set_id(rand::thread_rng().gen())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_ascii(key)
                    .map_err(|e| ProxyError::Resolution(format!("bad name {key}: {e}")))?,
                RecordType::A,
            ));

        let (url, connect_addr, sni) = self.doh_endpoint().await?;
        self.doh.exchange(&query, &url, &connect_addr, &sni).await
    }

    /// Pick the DoH endpoint. With the worker enabled, DNS rides the
    /// worker; otherwise the configured resolver is dialed directly,
    /// bootstrapping its own address through the system resolver.
    async fn doh_endpoint(&self) -> Result<(Url, String, String), ProxyError> {
        if self.worker.enabled {
            let url = Url::parse(&format!("https://{}/dns-query", self.worker.sni))
                .map_err(|e| ProxyError::Resolution(format!("worker DoH url: {e}")))?;
            return Ok((url, self.worker.host.clone(), self.worker.sni.clone()));
        }

        let url = Url::parse(&self.address)
            .map_err(|e| ProxyError::Resolution(format!("resolver url {}: {e}", self.address)))?;
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Resolution("resolver url has no host".into()))?
            .to_string();
        let port = url.port().unwrap_or(443);
        let connect_host = if host.parse::<std::net::IpAddr>().is_ok() {
            host.clone()
        } else {
            system_lookup(&host).await?
        };
        let connect_addr = crate::address::join_host_port(&connect_host, port);
        Ok((url, connect_addr, host))
    }
}

async fn system_lookup(name: &str) -> Result<String, ProxyError> {
    let mut addrs = tokio::net::lookup_host((name, 0))
        .await
        .map_err(|e| ProxyError::Resolution(format!("system lookup {name}: {e}")))?;
    addrs
        .next()
        .map(|sa| sa.ip().to_string())
        .ok_or_else(|| ProxyError::Resolution(format!("system lookup {name}: no addresses")))
}
