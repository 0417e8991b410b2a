//! Configuration module.
//!
//! The config file is JSON (the format the GUI wrapper and deployment
//! scripts emit). Invalid values never abort startup: validation rewrites
//! them to documented defaults and logs a warning. Only an unreadable file
//! or broken JSON is fatal.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use rand::{Rng, RngCore};
use serde::Deserialize;

use crate::fragment::FragmentPolicy;
use crate::logger::log;

const FRAGMENT_MODES: &[&str] = &["weak", "strong", "aggressive", "adaptive", "advanced"];
const TLS_FINGERPRINTS: &[&str] = &[
    "chrome", "edge", "firefox", "safari", "ios", "android", "auto",
];
const DNS_TYPES: &[&str] = &["udp", "tcp", "dot", "doh", "crypt", "system"];

const SESSION_ID_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890-";

/// CLI arguments. Environment variables use the SLIPGATE_ prefix.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Local anti-DPI proxy with fragmentation and worker tunneling")]
pub struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long = "config-file", env = "SLIPGATE_CONFIG")]
    pub config_file: PathBuf,

    /// Log level: trace, debug, info, warn, error
    #[arg(long = "log-level", env = "SLIPGATE_LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

fn default_bind() -> String {
    "127.0.0.1:8085".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct PaddingSection {
    pub enabled: bool,
    /// Inclusive [min, max] padding extension length in bytes
    pub length: [u16; 2],
}

fn default_fingerprint() -> String {
    "auto".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TlsSection {
    pub padding: PaddingSection,
    pub fingerprint: String,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            padding: PaddingSection::default(),
            fingerprint: default_fingerprint(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AdvancedFragmentSection {
    /// Fragment length range before the SNI
    pub bsl: [usize; 2],
    /// Fragment length range for the SNI itself
    pub sl: [usize; 2],
    /// Fragment length range after the SNI
    pub asl: [usize; 2],
}

fn default_fragment_mode() -> String {
    "weak".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FragmentSection {
    pub enable: bool,
    /// Inter-fragment delay range in milliseconds
    pub delay: [u64; 2],
    pub mode: String,
    pub advanced: AdvancedFragmentSection,
}

impl Default for FragmentSection {
    fn default() -> Self {
        Self {
            enable: false,
            delay: [0, 0],
            mode: default_fragment_mode(),
            advanced: AdvancedFragmentSection::default(),
        }
    }
}

/// A domain-to-IP override entry.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub domain: String,
    pub ip: String,
}

fn default_dns_type() -> String {
    "doh".to_string()
}

fn default_dns_address() -> String {
    "https://1.1.1.1/dns-query".to_string()
}

fn default_dns_ttl() -> u64 {
    300
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DnsSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    pub ttl: u64,
    pub hosts: Vec<HostEntry>,
}

impl Default for DnsSection {
    fn default() -> Self {
        Self {
            kind: default_dns_type(),
            address: default_dns_address(),
            ttl: default_dns_ttl(),
            hosts: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct WorkerSection {
    pub enable: bool,
    /// Worker hostname used as TLS SNI and WebSocket Host
    pub sni: String,
    /// Worker TCP endpoint, `ip:port` (pre-selected by the operator)
    pub host: String,
    /// Tunnel only DNS-over-HTTPS; raw TCP sessions bypass the worker
    pub dns_only: bool,
}

fn default_udp_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_udp_timeout() -> u64 {
    60
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UdpSection {
    pub enable: bool,
    pub bind: String,
    /// Per-frame tunnel read/write timeout in seconds
    pub timeout: u64,
}

impl Default for UdpSection {
    fn default() -> Self {
        Self {
            enable: true,
            bind: default_udp_bind(),
            timeout: default_udp_timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct UnixSection {
    /// Mark outbound sockets so host VPN routing can exempt them.
    /// The marking itself is done by the platform wrapper; the engine only
    /// records the intent.
    pub protected: bool,
}

/// Per-process session identity prepended to tunnel traffic.
#[derive(Debug, Clone)]
pub struct Session {
    /// 4-digit decimal session tag carried in the worker endpoint URL
    pub session_id: String,
    /// 6-char alphanumeric tag prepended to every tunnel request frame
    pub client_id: String,
}

impl Session {
    pub fn generate() -> Self {
        let session_id = format!("{}", rand::thread_rng().gen_range(1000..10000));

        let mut raw = [0u8; 6];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let client_id: String = raw
            .iter()
            .map(|b| SESSION_ID_CHARS[*b as usize % SESSION_ID_CHARS.len()] as char)
            .collect();

        Self {
            session_id,
            client_id,
        }
    }
}

/// Routing policy for the remote worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerPolicy {
    pub enabled: bool,
    pub sni: String,
    pub host: String,
    pub dns_only: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub tls: TlsSection,
    pub fragment: FragmentSection,
    pub dns: DnsSection,
    pub worker: WorkerSection,
    pub udp: UdpSection,
    pub unix: UnixSection,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: Config =
            serde_json::from_str(raw).context("failed to parse config JSON")?;
        config.validate();
        Ok(config)
    }

    /// Rewrite invalid values to documented defaults, logging each rewrite.
    pub fn validate(&mut self) {
        if !bind_is_available(&self.server.bind) {
            log::warn!(
                bind = %self.server.bind,
                "bind address unavailable, listening on an ephemeral port instead"
            );
            self.server.bind = "127.0.0.1:0".to_string();
        }

        if self.tls.padding.enabled {
            let [min, max] = &mut self.tls.padding.length;
            if *min > *max {
                std::mem::swap(min, max);
            }
            // A zero-length padding extension would be indistinguishable
            // from no padding; promote to one byte.
            if *min == 0 {
                *min = 1;
            }
            if *max == 0 {
                *max = 1;
            }
        }

        if !TLS_FINGERPRINTS.contains(&self.tls.fingerprint.as_str()) {
            log::warn!(
                fingerprint = %self.tls.fingerprint,
                "invalid tls fingerprint, set to default tls fingerprint: `auto`"
            );
            self.tls.fingerprint = "auto".to_string();
        }

        if self.fragment.enable {
            if self.fragment.delay[0] > self.fragment.delay[1] {
                self.fragment.delay.swap(0, 1);
            }
            if !FRAGMENT_MODES.contains(&self.fragment.mode.as_str()) {
                log::warn!(
                    mode = %self.fragment.mode,
                    "invalid fragment mode, set to default fragment mode: `weak`"
                );
                self.fragment.mode = "weak".to_string();
            }
            if self.fragment.mode == "advanced" {
                let adv = &mut self.fragment.advanced;
                for range in [&mut adv.bsl, &mut adv.sl, &mut adv.asl] {
                    if range[0] > range[1] {
                        range.swap(0, 1);
                    }
                }
            }
        }

        if !DNS_TYPES.contains(&self.dns.kind.as_str()) {
            log::warn!(
                kind = %self.dns.kind,
                "invalid dns type, set to default dns type: `system`"
            );
            self.dns.kind = "system".to_string();
        } else if !matches!(self.dns.kind.as_str(), "doh" | "system") {
            // Other transports are handled by external resolver tooling.
            log::warn!(
                kind = %self.dns.kind,
                "dns type not handled by this build, falling back to `system`"
            );
            self.dns.kind = "system".to_string();
        }

        if self.dns.ttl == 0 {
            self.dns.ttl = default_dns_ttl();
        }

        if self.worker.enable && (self.worker.sni.is_empty() || self.worker.host.is_empty()) {
            log::warn!("worker enabled without sni/host, disabling worker mode");
            self.worker.enable = false;
        }

        if self.udp.timeout == 0 {
            self.udp.timeout = default_udp_timeout();
        }
    }

    /// Fragment policy in effect, if fragmentation is enabled.
    ///
    /// Non-advanced modes map to built-in length presets; `advanced` takes
    /// the explicit ranges from the config.
    pub fn fragment_policy(&self) -> Option<FragmentPolicy> {
        if !self.fragment.enable {
            return None;
        }
        let delay = (self.fragment.delay[0], self.fragment.delay[1]);
        let policy = match self.fragment.mode.as_str() {
            "advanced" => {
                let adv = &self.fragment.advanced;
                FragmentPolicy::new(
                    (adv.bsl[0], adv.bsl[1]),
                    (adv.sl[0], adv.sl[1]),
                    (adv.asl[0], adv.asl[1]),
                    delay,
                )
            }
            "strong" => FragmentPolicy::new((50, 100), (2, 4), (50, 100), delay),
            "aggressive" => FragmentPolicy::new((20, 50), (1, 3), (20, 50), delay),
            "adaptive" => FragmentPolicy::new((40, 120), (2, 5), (40, 120), delay),
            // "weak"
            _ => FragmentPolicy::new((100, 200), (3, 5), (100, 200), delay),
        };
        Some(policy)
    }

    pub fn worker_policy(&self) -> WorkerPolicy {
        WorkerPolicy {
            enabled: self.worker.enable,
            sni: self.worker.sni.clone(),
            host: self.worker.host.clone(),
            dns_only: self.worker.dns_only,
        }
    }
}

/// Probe the bind address the non-invasive way: if something answers a
/// connect there, the port is taken.
fn bind_is_available(bind: &str) -> bool {
    use std::net::ToSocketAddrs;
    let Ok(mut addrs) = bind.to_socket_addrs() else {
        return false;
    };
    let Some(addr) = addrs.next() else {
        return false;
    };
    if addr.port() == 0 {
        return true;
    }
    std::net::TcpStream::connect_timeout(&addr, std::time::Duration::from_millis(100)).is_err()
}
