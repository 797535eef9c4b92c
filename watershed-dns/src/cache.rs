//! Route classification caches
//!
//! Two time-expiring maps shared by both fronts: `ip -> route` and
//! `domain -> (answer, route)`. Entries expire lazily on read and are also
//! removed by a periodic sweep. The cache TTL is fixed at insert time and
//! deliberately independent of the DNS record's own TTL.

use crate::Route;
use hickory_proto::rr::{Name, Record};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default sweep interval, roughly twice the entry lifetime.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Internally synchronized string-keyed map with per-cache TTL.
struct TtlMap<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    ttl: Duration,
}

impl<V: Clone> TtlMap<V> {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn insert(&self, key: String, value: V) {
        self.entries.write().insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.stored_at.elapsed() <= ttl);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Cache of `ip -> route` decisions.
pub struct IpCache {
    map: TtlMap<Route>,
}

impl IpCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: TtlMap::new(ttl),
        }
    }

    /// Insert or overwrite, resetting the TTL. Empty keys are ignored.
    pub fn add(&self, ip: &str, route: Route) {
        if ip.is_empty() {
            return;
        }
        trace!("ip cache: {} -> {}", ip, route);
        self.map.insert(ip.to_string(), route);
    }

    pub fn get(&self, ip: &str) -> Option<Route> {
        self.map.get(ip)
    }

    pub fn sweep(&self) {
        let removed = self.map.sweep();
        if removed > 0 {
            debug!("ip cache sweep removed {} entries", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

impl Default for IpCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Cached classification for one domain.
#[derive(Clone)]
pub struct DomainEntry {
    /// Address record served back for the domain.
    pub answer: Record,
    /// Route decided for the addresses in the answer.
    pub route: Route,
}

/// Cache of `domain -> (answer, route)` decisions.
pub struct DomainCache {
    map: TtlMap<DomainEntry>,
}

impl DomainCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            map: TtlMap::new(ttl),
        }
    }

    /// Insert or overwrite, resetting the TTL. Empty keys are ignored, and
    /// the stored record's owner name is normalized to the fully-qualified
    /// form of the key.
    pub fn add(&self, domain: &str, answer: &Record, route: Route) {
        if domain.is_empty() {
            return;
        }
        let Ok(mut fqdn) = Name::from_ascii(domain) else {
            trace!("domain cache: unstorable key {:?}", domain);
            return;
        };
        fqdn.set_fqdn(true);

        let answer = if answer.name() == &fqdn {
            answer.clone()
        } else {
            Record::from_rdata(fqdn, answer.ttl(), answer.data().clone())
        };
        trace!("domain cache: {} -> {}", domain, route);
        self.map.insert(domain.to_string(), DomainEntry {
            answer,
            route,
        });
    }

    pub fn get(&self, domain: &str) -> Option<DomainEntry> {
        self.map.get(domain)
    }

    pub fn sweep(&self) {
        let removed = self.map.sweep();
        if removed > 0 {
            debug!("domain cache sweep removed {} entries", removed);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

impl Default for DomainCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::RData;
    use std::str::FromStr;

    fn a_record(name: &str, addr: &str) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            60,
            RData::A(A(addr.parse().unwrap())),
        )
    }

    #[test]
    fn ip_cache_round_trip() {
        let cache = IpCache::new(Duration::from_secs(60));
        cache.add("93.184.216.34", Route::Proxy);
        assert_eq!(cache.get("93.184.216.34"), Some(Route::Proxy));
        assert_eq!(cache.get("1.2.3.4"), None);
    }

    #[test]
    fn ip_cache_overwrites() {
        let cache = IpCache::new(Duration::from_secs(60));
        cache.add("1.2.3.4", Route::Proxy);
        cache.add("1.2.3.4", Route::Direct);
        assert_eq!(cache.get("1.2.3.4"), Some(Route::Direct));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn empty_keys_are_ignored() {
        let ips = IpCache::new(Duration::from_secs(60));
        ips.add("", Route::Direct);
        assert!(ips.is_empty());

        let domains = DomainCache::new(Duration::from_secs(60));
        domains.add("", &a_record("example.com.", "1.2.3.4"), Route::Direct);
        assert!(domains.is_empty());
    }

    #[test]
    fn entries_expire() {
        let cache = IpCache::new(Duration::from_millis(10));
        cache.add("1.2.3.4", Route::Direct);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("1.2.3.4"), None);

        cache.sweep();
        assert!(cache.is_empty());
    }

    #[test]
    fn domain_cache_normalizes_owner_name() {
        let cache = DomainCache::new(Duration::from_secs(60));
        // answer's owner is the CDN name, key is the queried domain
        let record = a_record("edge.cdn.example.", "1.2.3.4");
        cache.add("www.example.com", &record, Route::Direct);

        let entry = cache.get("www.example.com").unwrap();
        assert_eq!(
            entry.answer.name(),
            &Name::from_str("www.example.com.").unwrap()
        );
        assert_eq!(entry.route, Route::Direct);
    }
}
