//! Extension probing for domains whose routes omit a file extension, with a
//! per-backend circuit breaker and single-flight probe collapsing.
//!
//! Grounded stylistically on `proxy::upstream`'s background health-check
//! wiring (state behind a lock, refreshed out of band) and
//! `proxy::health_check`'s lock-guarded registry shape; the breaker's
//! closed/open/half-open state machine itself has no teacher counterpart and
//! is built fresh from the contract in SPEC_FULL.md §4.4.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use ipnetwork::IpNetwork;
use lru::LruCache;
use once_cell::sync::Lazy;
use reqwest::Client;
use tokio::sync::{OnceCell, Semaphore};

use crate::config::FileResolutionConfig;
use crate::metrics::MetricsSink;

/// Outcome of resolving `base_url` against the configured extension list.
#[derive(Clone, Debug)]
pub struct FileResolution {
    pub success: bool,
    pub resolved_url: Option<String>,
    pub extension: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub cached: bool,
    pub circuit_open: bool,
}

impl FileResolution {
    fn negative() -> Self {
        Self {
            success: false,
            resolved_url: None,
            extension: None,
            content_type: None,
            content_length: None,
            cached: false,
            circuit_open: false,
        }
    }

    fn circuit_open() -> Self {
        Self {
            circuit_open: true,
            ..Self::negative()
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitState {
    phase: Phase,
    failure_count: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

impl CircuitState {
    fn new() -> Self {
        Self {
            phase: Phase::Closed,
            failure_count: 0,
            window_start: Instant::now(),
            opened_at: None,
            half_open_probe_in_flight: false,
        }
    }
}

enum Admission {
    Allowed,
    Blocked,
}

/// One breaker per backend host, per §4.4.
struct CircuitBreaker {
    states: DashMap<String, Mutex<CircuitState>>,
    failure_threshold: u32,
    reset_timeout: Duration,
    monitor_window: Duration,
}

impl CircuitBreaker {
    fn new(cfg: &crate::config::CircuitBreakerConfig) -> Self {
        Self {
            states: DashMap::new(),
            failure_threshold: cfg.failure_threshold,
            reset_timeout: Duration::from_millis(cfg.reset_timeout_ms),
            monitor_window: Duration::from_millis(cfg.monitor_window_ms),
        }
    }

    fn admit(&self, host: &str) -> Admission {
        let entry = self
            .states
            .entry(host.to_string())
            .or_insert_with(|| Mutex::new(CircuitState::new()));
        let mut state = entry.lock().unwrap();
        let now = Instant::now();
        match state.phase {
            Phase::Closed => Admission::Allowed,
            Phase::Open => {
                if now.duration_since(state.opened_at.unwrap_or(now)) >= self.reset_timeout {
                    state.phase = Phase::HalfOpen;
                    state.half_open_probe_in_flight = true;
                    MetricsSink::set_circuit_state(host, 1);
                    Admission::Allowed
                } else {
                    Admission::Blocked
                }
            }
            Phase::HalfOpen => {
                if state.half_open_probe_in_flight {
                    Admission::Blocked
                } else {
                    state.half_open_probe_in_flight = true;
                    Admission::Allowed
                }
            }
        }
    }

    /// Only transport/timeout failures count toward the threshold, per §4.4.
    fn record_failure(&self, host: &str) {
        let entry = self
            .states
            .entry(host.to_string())
            .or_insert_with(|| Mutex::new(CircuitState::new()));
        let mut state = entry.lock().unwrap();
        let now = Instant::now();
        match state.phase {
            Phase::Closed => {
                if now.duration_since(state.window_start) > self.monitor_window {
                    state.window_start = now;
                    state.failure_count = 0;
                }
                state.failure_count += 1;
                if state.failure_count >= self.failure_threshold {
                    state.phase = Phase::Open;
                    state.opened_at = Some(now);
                    MetricsSink::set_circuit_state(host, 2);
                }
            }
            Phase::HalfOpen => {
                state.phase = Phase::Open;
                state.opened_at = Some(now);
                state.half_open_probe_in_flight = false;
                MetricsSink::set_circuit_state(host, 2);
            }
            Phase::Open => {}
        }
    }

    fn record_success(&self, host: &str) {
        let entry = self
            .states
            .entry(host.to_string())
            .or_insert_with(|| Mutex::new(CircuitState::new()));
        let mut state = entry.lock().unwrap();
        if state.phase == Phase::HalfOpen {
            state.phase = Phase::Closed;
            state.failure_count = 0;
            state.half_open_probe_in_flight = false;
            MetricsSink::set_circuit_state(host, 0);
        }
    }

    /// 0 closed, 1 half-open, 2 open, for the metrics gauge.
    fn gauge(&self, host: &str) -> u8 {
        self.states
            .get(host)
            .map(|e| match e.lock().unwrap().phase {
                Phase::Closed => 0,
                Phase::HalfOpen => 1,
                Phase::Open => 2,
            })
            .unwrap_or(0)
    }
}

#[derive(Default)]
pub struct FileResolverStats {
    probes: AtomicU64,
    positive: AtomicU64,
    negative: AtomicU64,
    circuit_rejections: AtomicU64,
    cache_hits: AtomicU64,
}

impl FileResolverStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.probes.load(Ordering::Relaxed),
            self.positive.load(Ordering::Relaxed),
            self.negative.load(Ordering::Relaxed),
            self.circuit_rejections.load(Ordering::Relaxed),
            self.cache_hits.load(Ordering::Relaxed),
        )
    }
}

static PRIVATE_RANGES: Lazy<Vec<IpNetwork>> = Lazy::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .map(|s| s.parse().unwrap())
    .collect()
});

fn is_private(ip: &IpAddr) -> bool {
    PRIVATE_RANGES.iter().any(|net| net.contains(*ip))
}

pub struct FileResolver {
    config: FileResolutionConfig,
    client: Client,
    resolver: Option<TokioAsyncResolver>,
    semaphore: Semaphore,
    breaker: CircuitBreaker,
    positive_cache: Mutex<LruCache<String, (FileResolution, Instant)>>,
    negative_cache: Mutex<LruCache<String, Instant>>,
    in_flight: DashMap<String, std::sync::Arc<OnceCell<FileResolution>>>,
    stats: FileResolverStats,
}

impl FileResolver {
    pub fn new(config: FileResolutionConfig) -> Self {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("file resolver http client");
        let resolver = if config.block_private_ips {
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()).ok()
        } else {
            None
        };
        let cap = config.cache.max_size.max(1);
        Self {
            breaker: CircuitBreaker::new(&config.circuit_breaker),
            semaphore: Semaphore::new(config.max_concurrent.max(1)),
            positive_cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(cap).unwrap())),
            negative_cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(cap).unwrap())),
            in_flight: DashMap::new(),
            stats: FileResolverStats::default(),
            resolver,
            client,
            config,
        }
    }

    pub fn stats(&self) -> (u64, u64, u64, u64, u64) {
        self.stats.snapshot()
    }

    pub fn circuit_state(&self, backend_host: &str) -> u8 {
        self.breaker.gauge(backend_host)
    }

    /// Clears the positive and negative resolution caches. Returns the
    /// number of entries removed.
    pub fn clear_cache(&self) -> usize {
        let mut positive = self.positive_cache.lock().unwrap();
        let mut negative = self.negative_cache.lock().unwrap();
        let removed = positive.len() + negative.len();
        positive.clear();
        negative.clear();
        removed
    }

    fn extensions_for(&self, request_domain: &str) -> Vec<String> {
        self.config
            .per_domain_overrides
            .get(request_domain)
            .cloned()
            .unwrap_or_else(|| self.config.default_extensions.clone())
    }

    fn cache_key(base_url: &str, extensions: &[String]) -> String {
        format!("{base_url}|{}", extensions.join(","))
    }

    /// Resolves `base_url` (scheme+host+path, no extension) against the
    /// extension list that applies to `request_domain`.
    pub async fn resolve(&self, base_url: &str, request_domain: &str, backend_host: &str) -> FileResolution {
        if !self.config.enabled {
            return FileResolution::negative();
        }
        let extensions = self.extensions_for(request_domain);
        let key = Self::cache_key(base_url, &extensions);

        if let Some(mut hit) = self.lookup_positive(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            hit.cached = true;
            return hit;
        }
        if self.lookup_negative(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            let mut r = FileResolution::negative();
            r.cached = true;
            return r;
        }

        match self.breaker.admit(backend_host) {
            Admission::Blocked => {
                self.stats.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                MetricsSink::record_file_resolution_probe("circuit-open");
                return FileResolution::circuit_open();
            }
            Admission::Allowed => {}
        }

        let cell = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| std::sync::Arc::new(OnceCell::new()))
            .clone();
        let result = cell
            .get_or_init(|| self.run_campaign(base_url, &extensions, backend_host))
            .await
            .clone();
        self.in_flight.remove(&key);

        if result.success {
            self.breaker.record_success(backend_host);
            self.store_positive(key, result.clone());
        } else if !result.circuit_open {
            self.breaker.record_success(backend_host);
            self.store_negative(key);
        }
        result
    }

    fn lookup_positive(&self, key: &str) -> Option<FileResolution> {
        let mut cache = self.positive_cache.lock().unwrap();
        match cache.get(key) {
            Some((resolution, expires)) if *expires > Instant::now() => Some(resolution.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn lookup_negative(&self, key: &str) -> bool {
        let mut cache = self.negative_cache.lock().unwrap();
        match cache.get(key) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                cache.pop(key);
                false
            }
            None => false,
        }
    }

    fn store_positive(&self, key: String, resolution: FileResolution) {
        let expires = Instant::now() + Duration::from_secs(self.config.cache.ttl_secs);
        self.positive_cache.lock().unwrap().put(key, (resolution, expires));
    }

    fn store_negative(&self, key: String) {
        let expires = Instant::now() + Duration::from_secs(self.config.cache.negative_ttl_secs);
        self.negative_cache.lock().unwrap().put(key, expires);
    }

    /// Probes every candidate extension concurrently (bounded by the global
    /// semaphore) and picks the first positive result in declared priority
    /// order — never by which network response lands first, per §4.3.
    async fn run_campaign(&self, base_url: &str, extensions: &[String], backend_host: &str) -> FileResolution {
        if self.config.block_private_ips && self.points_at_private_ip(base_url).await {
            return FileResolution::negative();
        }

        let probes = extensions
            .iter()
            .map(|ext| self.probe_with_retry(base_url, ext, backend_host));
        let results = futures::future::join_all(probes).await;

        for (ext, outcome) in extensions.iter().zip(results.into_iter()) {
            if let Some((url, content_type, len)) = outcome {
                return FileResolution {
                    success: true,
                    resolved_url: Some(url),
                    extension: Some(ext.clone()),
                    content_type,
                    content_length: len,
                    cached: false,
                    circuit_open: false,
                };
            }
        }
        FileResolution::negative()
    }

    async fn points_at_private_ip(&self, base_url: &str) -> bool {
        let Some(resolver) = &self.resolver else {
            return false;
        };
        let Ok(url) = reqwest::Url::parse(base_url) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        if let Ok(ip) = host.parse::<IpAddr>() {
            return is_private(&ip);
        }
        match resolver.lookup_ip(host).await {
            Ok(lookup) => lookup.iter().any(|ip| is_private(&ip)),
            Err(_) => false,
        }
    }

    async fn probe_with_retry(
        &self,
        base_url: &str,
        extension: &str,
        backend_host: &str,
    ) -> Option<(String, Option<String>, Option<u64>)> {
        let url = format!("{base_url}.{extension}");
        let mut attempt = 0;
        loop {
            let _permit = self.semaphore.acquire().await.ok()?;
            self.stats.probes.fetch_add(1, Ordering::Relaxed);
            match self.probe_once(&url).await {
                ProbeOutcome::Positive(content_type, len) => {
                    self.stats.positive.fetch_add(1, Ordering::Relaxed);
                    MetricsSink::record_file_resolution_probe("positive");
                    return Some((url, content_type, len));
                }
                ProbeOutcome::Negative => {
                    self.stats.negative.fetch_add(1, Ordering::Relaxed);
                    MetricsSink::record_file_resolution_probe("negative");
                    return None;
                }
                ProbeOutcome::Transient => {
                    attempt += 1;
                    if attempt > self.config.retry.attempts {
                        self.breaker.record_failure(backend_host);
                        self.stats.negative.fetch_add(1, Ordering::Relaxed);
                        MetricsSink::record_file_resolution_probe("error");
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.retry.delay_ms * attempt as u64)).await;
                }
            }
        }
    }

    async fn probe_once(&self, url: &str) -> ProbeOutcome {
        let head = self.client.head(url).send().await;
        let resp = match head {
            Ok(r) if r.status().as_u16() == 405 || r.status().as_u16() == 501 => {
                match self.client.get(url).send().await {
                    Ok(r) => r,
                    Err(e) => return transient_or_negative(&e),
                }
            }
            Ok(r) => r,
            Err(e) => return transient_or_negative(&e),
        };

        if !resp.status().is_success() {
            return ProbeOutcome::Negative;
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        if let Some(ct) = &content_type {
            let base_ct = ct.split(';').next().unwrap_or(ct).trim();
            if !self.config.allowed_content_types.iter().any(|a| a == base_ct) {
                return ProbeOutcome::Negative;
            }
        }
        let len = resp.content_length();
        if let Some(size) = len {
            if size > self.config.max_file_size {
                return ProbeOutcome::Negative;
            }
        }
        ProbeOutcome::Positive(content_type, len)
    }
}

enum ProbeOutcome {
    Positive(Option<String>, Option<u64>),
    Negative,
    Transient,
}

fn transient_or_negative(e: &reqwest::Error) -> ProbeOutcome {
    if e.is_timeout() || e.is_connect() {
        ProbeOutcome::Transient
    } else {
        ProbeOutcome::Negative
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FileResolutionConfig {
        FileResolutionConfig {
            enabled: true,
            default_extensions: vec!["html".to_string(), "md".to_string()],
            timeout_ms: 2000,
            max_concurrent: 4,
            retry: crate::config::RetryConfig {
                attempts: 1,
                delay_ms: 10,
            },
            cache: crate::config::FileCacheConfig {
                ttl_secs: 60,
                negative_ttl_secs: 5,
                max_size: 100,
            },
            circuit_breaker: crate::config::CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout_ms: 50,
                monitor_window_ms: 1000,
            },
            per_domain_overrides: HashMap::new(),
            allowed_content_types: vec!["text/html".to_string()],
            block_private_ips: false,
            user_agent: "brinkcdn-file-resolver".to_string(),
            max_file_size: 10 * 1024 * 1024,
        }
    }

    #[test]
    fn extensions_for_uses_override_when_present() {
        let mut config = cfg();
        config
            .per_domain_overrides
            .insert("special.example".to_string(), vec!["txt".to_string()]);
        let resolver = FileResolver::new(config);
        assert_eq!(resolver.extensions_for("special.example"), vec!["txt".to_string()]);
        assert_eq!(resolver.extensions_for("other.example"), vec!["html".to_string(), "md".to_string()]);
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(&crate::config::CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout_ms: 30_000,
            monitor_window_ms: 60_000,
        });
        assert!(matches!(breaker.admit("origin.example"), Admission::Allowed));
        breaker.record_failure("origin.example");
        assert!(matches!(breaker.admit("origin.example"), Admission::Allowed));
        breaker.record_failure("origin.example");
        assert!(matches!(breaker.admit("origin.example"), Admission::Blocked));
    }

    #[test]
    fn circuit_breaker_half_opens_after_reset_timeout() {
        let breaker = CircuitBreaker::new(&crate::config::CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 1,
            monitor_window_ms: 60_000,
        });
        breaker.record_failure("origin.example");
        assert!(matches!(breaker.admit("origin.example"), Admission::Blocked));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(breaker.admit("origin.example"), Admission::Allowed));
    }

    #[test]
    fn half_open_allows_only_one_probe_at_a_time() {
        let breaker = CircuitBreaker::new(&crate::config::CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 1,
            monitor_window_ms: 60_000,
        });
        breaker.record_failure("origin.example");
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(breaker.admit("origin.example"), Admission::Allowed));
        assert!(matches!(breaker.admit("origin.example"), Admission::Blocked));
    }

    #[test]
    fn successful_probe_closes_half_open_circuit() {
        let breaker = CircuitBreaker::new(&crate::config::CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 1,
            monitor_window_ms: 60_000,
        });
        breaker.record_failure("origin.example");
        std::thread::sleep(Duration::from_millis(5));
        breaker.admit("origin.example");
        breaker.record_success("origin.example");
        assert!(matches!(breaker.admit("origin.example"), Admission::Allowed));
        assert_eq!(breaker.gauge("origin.example"), 0);
    }

    #[test]
    fn private_ip_ranges_detect_loopback_and_rfc1918() {
        assert!(is_private(&"127.0.0.1".parse().unwrap()));
        assert!(is_private(&"10.1.2.3".parse().unwrap()));
        assert!(is_private(&"192.168.1.1".parse().unwrap()));
        assert!(!is_private(&"8.8.8.8".parse().unwrap()));
    }
}
