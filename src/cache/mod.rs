//! In-memory TTL+LRU response cache keyed by a composite fingerprint.
//!
//! Grounded on the teacher's sharded-registry idiom in `proxy::mod::MapOperations`
//! (a `DashMap`-backed table mutated by any request) combined with an `lru`
//! eviction ring per shard to get true LRU behavior instead of `DashMap`'s
//! unordered retention.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::Service;

use crate::metrics::MetricsSink;
use crate::route::RouteDecision;

const SHARD_COUNT: usize = 16;

#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub original_content_encoding: Option<String>,
    pub stored_at: Instant,
    pub expires_at: Instant,
    pub route_decision: RouteDecision,
}

struct Shard {
    lru: Mutex<LruCache<String, CachedResponse>>,
}

impl Shard {
    fn new(capacity: usize) -> Self {
        Self {
            lru: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
        }
    }
}

#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
            self.expirations.load(Ordering::Relaxed),
        )
    }
}

pub struct ResponseCache {
    shards: Vec<Shard>,
    max_ttl: Duration,
    check_period: Duration,
    stats: CacheStats,
}

fn shard_index(key: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

impl ResponseCache {
    pub fn new(max_items: usize, max_ttl_secs: u64, check_period_secs: u64) -> Self {
        let per_shard = (max_items / SHARD_COUNT).max(1);
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::new(per_shard)).collect(),
            max_ttl: Duration::from_secs(max_ttl_secs),
            check_period: Duration::from_secs(check_period_secs.max(1)),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let shard = &self.shards[shard_index(key)];
        let mut lru = shard.lru.lock().unwrap();
        match lru.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                MetricsSink::record_cache_event("hit");
                Some(entry.clone())
            }
            Some(_) => {
                lru.pop(key);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                MetricsSink::record_cache_event("expiration");
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                MetricsSink::record_cache_event("miss");
                None
            }
        }
    }

    /// Clamps `ttl` to `[0, maxTTL]` before storing, per §4.2.
    pub fn put(&self, key: String, mut response: CachedResponse, ttl: Duration) {
        let clamped = ttl.min(self.max_ttl);
        response.expires_at = response.stored_at + clamped;
        let shard = &self.shards[shard_index(&key)];
        let mut lru = shard.lru.lock().unwrap();
        if lru.len() >= lru.cap().get() && !lru.contains(&key) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            MetricsSink::record_cache_event("eviction");
        }
        lru.put(key, response);
    }

    /// Glob purge (`*` wildcard) with an optional domain filter matching the
    /// 2nd colon-delimited component of the key, per §4.2.
    pub fn purge(&self, pattern: &str, domain: Option<&str>) -> usize {
        let matcher = glob_to_regex(pattern);
        let mut removed = 0;
        for shard in &self.shards {
            let mut lru = shard.lru.lock().unwrap();
            let doomed: Vec<String> = lru
                .iter()
                .filter(|(k, _)| {
                    matcher.is_match(k)
                        && domain.map(|d| key_domain(k) == Some(d)).unwrap_or(true)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                lru.pop(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn stats(&self) -> (u64, u64, u64, u64, usize) {
        let (hits, misses, evictions, expirations) = self.stats.snapshot();
        let size: usize = self.shards.iter().map(|s| s.lru.lock().unwrap().len()).sum();
        (hits, misses, evictions, expirations, size)
    }

    /// Background sweep removing expired entries, same role as the
    /// teacher's `logging::Logger` background `Service`.
    fn sweep_expired(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            let mut lru = shard.lru.lock().unwrap();
            let expired: Vec<String> = lru
                .iter()
                .filter(|(_, v)| v.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                lru.pop(&key);
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                MetricsSink::record_cache_event("expiration");
            }
        }
    }

    pub fn check_period(&self) -> Duration {
        self.check_period
    }
}

fn key_domain(key: &str) -> Option<&str> {
    key.split(':').nth(1)
}

fn glob_to_regex(pattern: &str) -> regex::Regex {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    regex::Regex::new(&format!("^{escaped}$")).unwrap_or_else(|_| regex::Regex::new("$^").unwrap())
}

/// Builds the composite fingerprint described in §3: method, host, path,
/// routing outcome, and the `Vary`-relevant request headers.
pub fn cache_key(
    method: &str,
    host: &str,
    path: &str,
    decision: &RouteDecision,
    vary_headers: &[(&str, &str)],
    accept_encoding: &str,
    accept_language_primary: &str,
) -> String {
    let mut key = format!(
        "{method}:{host}:{path}:{}:{}:{}",
        decision.upstream_path, decision.backend_host, decision.matched
    );
    for (name, value) in vary_headers {
        key.push(':');
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key.push_str(":ae=");
    key.push_str(accept_encoding);
    key.push_str(":al=");
    key.push_str(accept_language_primary);
    key
}

/// Background eviction task as a pingora `Service`, same shape as the
/// teacher's `logging::Logger`.
pub struct EvictionService {
    pub cache: std::sync::Arc<ResponseCache>,
}

#[async_trait]
impl Service for EvictionService {
    async fn start_service(
        &mut self,
        _fds: Option<pingora_core::server::ListenFds>,
        mut shutdown: ShutdownWatch,
    ) {
        let period = self.cache.check_period();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("shutdown signal received, stopping cache eviction");
                        break;
                    }
                }
                _ = tokio::time::sleep(period) => {
                    self.cache.sweep_expired();
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "cache eviction"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteDecision;

    fn decision() -> RouteDecision {
        RouteDecision {
            backend_host: "origin.example".to_string(),
            use_tls: true,
            upstream_path: "/doc".to_string(),
            matched: true,
            fallback_used: false,
            applied_rule: Some("1".to_string()),
        }
    }

    fn entry(body: &[u8]) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![],
            body: body.to_vec(),
            original_content_encoding: None,
            stored_at: Instant::now(),
            expires_at: Instant::now() + Duration::from_secs(60),
            route_decision: decision(),
        }
    }

    #[test]
    fn put_then_get_round_trips_bytes() {
        let cache = ResponseCache::new(100, 3600, 60);
        cache.put("k1".to_string(), entry(b"<html></html>"), Duration::from_secs(30));
        let hit = cache.get("k1").unwrap();
        assert_eq!(hit.body, b"<html></html>");
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = ResponseCache::new(100, 3600, 60);
        let mut e = entry(b"x");
        e.expires_at = Instant::now() - Duration::from_secs(1);
        cache.put("k1".to_string(), e, Duration::from_secs(0));
        assert!(cache.get("k1").is_none());
    }

    #[test]
    fn ttl_clamped_to_max() {
        let cache = ResponseCache::new(100, 10, 60);
        cache.put("k1".to_string(), entry(b"x"), Duration::from_secs(1000));
        // max_ttl=10s, so the entry must still be present immediately after insert
        assert!(cache.get("k1").is_some());
    }

    #[test]
    fn purge_glob_removes_matching_keys() {
        let cache = ResponseCache::new(100, 3600, 60);
        cache.put("GET:a.example:/x".to_string(), entry(b"x"), Duration::from_secs(60));
        cache.put("GET:b.example:/y".to_string(), entry(b"y"), Duration::from_secs(60));
        let removed = cache.purge("GET:a.example:*", None);
        assert_eq!(removed, 1);
        assert!(cache.get("GET:a.example:/x").is_none());
        assert!(cache.get("GET:b.example:/y").is_some());
    }

    #[test]
    fn cache_key_is_stable_for_identical_inputs() {
        let d = decision();
        let k1 = cache_key("GET", "a.example", "/x", &d, &[("accept", "text/html")], "gzip", "en");
        let k2 = cache_key("GET", "a.example", "/x", &d, &[("accept", "text/html")], "gzip", "en");
        assert_eq!(k1, k2);
    }
}
