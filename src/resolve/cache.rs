//! Session-lifetime DNS cache.
//!
//! Keys are fully-qualified names with a trailing dot. The TTL is the
//! operator-configured session TTL, not the record TTL: the cache exists
//! to avoid re-querying the (slow, possibly tunneled) resolver, not to
//! honor upstream cache-control.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct CacheEntry {
    ip: String,
    cached_at: Instant,
}

pub struct DnsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up a fully-qualified key. Expired entries are invisible.
    pub fn get(&self, fqdn: &str) -> Option<String> {
        debug_assert!(fqdn.ends_with('.'), "cache keys carry a trailing dot");
        let entries = self.entries.read().expect("dns cache lock poisoned");
        let entry = entries.get(fqdn)?;
        if entry.cached_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.ip.clone())
    }

    pub fn set(&self, fqdn: String, ip: String) {
        debug_assert!(fqdn.ends_with('.'), "cache keys carry a trailing dot");
        let mut entries = self.entries.write().expect("dns cache lock poisoned");
        entries.insert(
            fqdn,
            CacheEntry {
                ip,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("dns cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
