use std::{collections::HashMap, fs, net::SocketAddr};

use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{ProxyError, ProxyResult};

/// Enables uniform ID handling across configuration entities, same role as
/// the teacher's trait of the same name.
pub trait Identifiable {
    fn id(&self) -> &str;
}

macro_rules! impl_identifiable {
    ($type:ty) => {
        impl Identifiable for $type {
            fn id(&self) -> &str {
                &self.id
            }
        }
    };
}

/// Root configuration: pingora's server-process settings plus this proxy's
/// own settings, loaded from YAML and overlaid with environment variables.
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    pub server: Server,

    #[validate(nested)]
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    #[validate(nested)]
    #[serde(default)]
    pub cache: CacheConfig,

    #[validate(nested)]
    #[serde(default)]
    pub file_resolution: FileResolutionConfig,

    #[validate(nested)]
    #[serde(default)]
    pub url_transform: UrlTransformConfig,

    #[validate(nested)]
    #[serde(default)]
    pub transformers: TransformersConfig,
}

impl_identifiable!(RouteRule);

impl Config {
    /// Loads configuration from a YAML file, then applies the environment
    /// overlay and CLI overrides, validating at every step.
    pub fn load_from_yaml<P>(path: P) -> ProxyResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .map_err(|e| ProxyError::Configuration(format!("reading {path}: {e}")))?;
        Self::from_yaml(&conf_str)
    }

    pub fn load_yaml_with_opt_override(opt: &Opt) -> ProxyResult<Self> {
        let path = opt
            .conf
            .as_ref()
            .ok_or_else(|| ProxyError::Configuration("no config path specified".to_string()))?;
        let mut conf = Self::load_from_yaml(path)?;
        conf.apply_env_overrides();
        conf.merge_with_opt(opt);
        conf.validate()
            .map_err(|e| ProxyError::Configuration(e.to_string()))?;
        Self::validate_unique_route_ids(&conf.routes)?;
        Ok(conf)
    }

    pub fn from_yaml(conf_str: &str) -> ProxyResult<Self> {
        let conf: Config = serde_yaml::from_str(conf_str)
            .map_err(|e| ProxyError::Configuration(format!("parsing config: {e}")))?;
        conf.validate()
            .map_err(|e| ProxyError::Configuration(e.to_string()))?;
        Self::validate_unique_route_ids(&conf.routes)?;
        Ok(conf)
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| {
            log::error!("failed to serialize config to YAML: {e}");
            String::new()
        })
    }

    fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_unique_route_ids(routes: &[RouteRule]) -> ProxyResult<()> {
        let mut ids = std::collections::HashSet::new();
        for route in routes {
            if !ids.insert(route.id.as_str()) {
                return Err(ProxyError::Configuration(format!(
                    "duplicate route id: {}",
                    route.id
                )));
            }
        }
        Ok(())
    }

    /// Every scalar field in `cache`/`file_resolution`/`url_transform` has a
    /// documented env key (`CDN_<SECTION>_<FIELD>`); list/map-shaped fields
    /// accept a JSON value and fall back to empty with a warning if it
    /// doesn't parse, rather than failing startup.
    fn apply_env_overrides(&mut self) {
        env_u64("CDN_CACHE_DEFAULT_TTL_SECS", &mut self.cache.default_ttl_secs);
        env_u64("CDN_CACHE_MAX_TTL_SECS", &mut self.cache.max_ttl_secs);
        env_u64("CDN_CACHE_CHECK_PERIOD_SECS", &mut self.cache.check_period_secs);
        env_usize("CDN_CACHE_MAX_ITEMS", &mut self.cache.max_items);
        env_bool(
            "CDN_CACHE_RESPECT_CACHE_CONTROL",
            &mut self.cache.respect_cache_control,
        );
        env_bool("CDN_CACHE_CACHE_COOKIES", &mut self.cache.cache_cookies);
        env_json("CDN_CACHE_CACHEABLE_STATUS_CODES", &mut self.cache.cacheable_status_codes);
        env_json(
            "CDN_CACHE_CACHEABLE_CONTENT_TYPES",
            &mut self.cache.cacheable_content_types,
        );

        env_bool("CDN_FILE_RESOLUTION_ENABLED", &mut self.file_resolution.enabled);
        env_json(
            "CDN_FILE_RESOLUTION_DEFAULT_EXTENSIONS",
            &mut self.file_resolution.default_extensions,
        );
        env_u64("CDN_FILE_RESOLUTION_TIMEOUT_MS", &mut self.file_resolution.timeout_ms);
        env_usize(
            "CDN_FILE_RESOLUTION_MAX_CONCURRENT",
            &mut self.file_resolution.max_concurrent,
        );
        env_bool(
            "CDN_FILE_RESOLUTION_BLOCK_PRIVATE_IPS",
            &mut self.file_resolution.block_private_ips,
        );
        env_u64("CDN_FILE_RESOLUTION_MAX_FILE_SIZE", &mut self.file_resolution.max_file_size);

        env_bool("CDN_URL_TRANSFORM_ENABLED", &mut self.url_transform.enabled);
        env_bool("CDN_URL_TRANSFORM_DEBUG", &mut self.url_transform.debug);
        env_u64("CDN_URL_TRANSFORM_MAX_CONTENT_SIZE", &mut self.url_transform.max_content_size);
    }
}

fn env_u64(key: &str, field: &mut u64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *field = v,
            Err(_) => log::warn!("ignoring unparseable {key}={raw}"),
        }
    }
}

fn env_usize(key: &str, field: &mut usize) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *field = v,
            Err(_) => log::warn!("ignoring unparseable {key}={raw}"),
        }
    }
}

fn env_bool(key: &str, field: &mut bool) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *field = v,
            Err(_) => log::warn!("ignoring unparseable {key}={raw}"),
        }
    }
}

fn env_json<T: serde::de::DeserializeOwned + Default>(key: &str, field: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match serde_json::from_str(&raw) {
            Ok(v) => *field = v,
            Err(e) => {
                log::warn!("ignoring unparseable JSON env var {key}: {e}, using empty default");
                *field = T::default();
            }
        }
    }
}

/// Ambient process settings: listeners, admin surface, logging, proxy identity.
#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
pub struct Server {
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    pub admin: Admin,

    #[validate(nested)]
    pub log: Option<Log>,

    #[serde(default = "Server::default_cdn_name")]
    pub cdn_name: String,

    #[serde(default = "Server::default_proxy_name")]
    pub proxy_name: String,
}

impl Server {
    fn default_cdn_name() -> String {
        "brinkcdn".to_string()
    }

    fn default_proxy_name() -> String {
        "brinkcdn".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
    #[serde(default)]
    pub offer_h2c: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Admin {
    pub address: SocketAddr,
    pub api_key: String,
}

impl Default for Admin {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9090".parse().unwrap(),
            api_key: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(custom(function = "Log::validate_path"))]
    pub path: String,
    #[serde(default = "Log::default_level")]
    pub level: String,
}

impl Log {
    fn default_level() -> String {
        "info".to_string()
    }

    fn validate_path(path: &str) -> Result<(), ValidationError> {
        if path.is_empty() || path.contains('\0') {
            return Err(ValidationError::new("invalid_log_path"));
        }
        Ok(())
    }
}

/// Where to send a request whose host/path matched a rule.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct Backend {
    pub host: String,
    #[serde(default)]
    pub use_tls: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Fallback {
    #[default]
    Prefix,
    Passthrough,
    Error,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct InnerRule {
    #[serde(default)]
    pub methods: Vec<String>,
    /// Exactly one of `path_regex`/`path_prefix` should be set; `path_regex`
    /// takes precedence when both are present.
    pub path_regex: Option<String>,
    pub path_prefix: Option<String>,
    pub replacement: String,
    #[serde(default)]
    pub stop: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
#[validate(schema(function = "RouteRule::validate_domain_pattern"))]
pub struct RouteRule {
    #[serde(default)]
    pub id: String,
    pub domain_pattern: String,
    #[validate(nested)]
    pub backend: Backend,
    pub path_prefix: Option<String>,
    #[validate(nested)]
    #[serde(default)]
    pub inner_rules: Vec<InnerRule>,
    #[serde(default)]
    pub fallback: Fallback,
}

impl RouteRule {
    fn validate_domain_pattern(&self) -> Result<(), ValidationError> {
        if self.domain_pattern.is_empty() {
            return Err(ValidationError::new("domain_pattern_required"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "CacheConfig::default_max_ttl")]
    pub max_ttl_secs: u64,
    #[serde(default = "CacheConfig::default_check_period")]
    pub check_period_secs: u64,
    #[serde(default = "CacheConfig::default_max_items")]
    pub max_items: usize,
    #[serde(default = "CacheConfig::default_true")]
    pub respect_cache_control: bool,
    #[serde(default = "CacheConfig::default_cacheable_status_codes")]
    pub cacheable_status_codes: Vec<u16>,
    #[serde(default = "CacheConfig::default_cacheable_content_types")]
    pub cacheable_content_types: Vec<String>,
    #[serde(default)]
    pub cache_cookies: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: Self::default_ttl(),
            max_ttl_secs: Self::default_max_ttl(),
            check_period_secs: Self::default_check_period(),
            max_items: Self::default_max_items(),
            respect_cache_control: true,
            cacheable_status_codes: Self::default_cacheable_status_codes(),
            cacheable_content_types: Self::default_cacheable_content_types(),
            cache_cookies: false,
        }
    }
}

impl CacheConfig {
    fn default_ttl() -> u64 {
        300
    }
    fn default_max_ttl() -> u64 {
        86400
    }
    fn default_check_period() -> u64 {
        60
    }
    fn default_max_items() -> usize {
        10_000
    }
    fn default_true() -> bool {
        true
    }
    fn default_cacheable_status_codes() -> Vec<u16> {
        vec![200, 203, 300, 301, 302, 404, 410]
    }
    fn default_cacheable_content_types() -> Vec<String> {
        vec![
            "text/html".to_string(),
            "text/css".to_string(),
            "application/javascript".to_string(),
            "application/json".to_string(),
            "image/".to_string(),
            "font/".to_string(),
        ]
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_attempts")]
    pub attempts: u32,
    #[serde(default = "RetryConfig::default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            delay_ms: Self::default_delay_ms(),
        }
    }
}

impl RetryConfig {
    fn default_attempts() -> u32 {
        2
    }
    fn default_delay_ms() -> u64 {
        100
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct FileCacheConfig {
    #[serde(default = "FileCacheConfig::default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "FileCacheConfig::default_negative_ttl")]
    pub negative_ttl_secs: u64,
    #[serde(default = "FileCacheConfig::default_max_size")]
    pub max_size: usize,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: Self::default_ttl(),
            negative_ttl_secs: Self::default_negative_ttl(),
            max_size: Self::default_max_size(),
        }
    }
}

impl FileCacheConfig {
    fn default_ttl() -> u64 {
        3600
    }
    fn default_negative_ttl() -> u64 {
        60
    }
    fn default_max_size() -> usize {
        10_000
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CircuitBreakerConfig {
    #[serde(default = "CircuitBreakerConfig::default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "CircuitBreakerConfig::default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "CircuitBreakerConfig::default_monitor_window_ms")]
    pub monitor_window_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Self::default_failure_threshold(),
            reset_timeout_ms: Self::default_reset_timeout_ms(),
            monitor_window_ms: Self::default_monitor_window_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    fn default_failure_threshold() -> u32 {
        3
    }
    fn default_reset_timeout_ms() -> u64 {
        30_000
    }
    fn default_monitor_window_ms() -> u64 {
        60_000
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct FileResolutionConfig {
    #[serde(default = "FileResolutionConfig::default_true")]
    pub enabled: bool,
    #[serde(default = "FileResolutionConfig::default_extensions")]
    pub default_extensions: Vec<String>,
    #[serde(default = "FileResolutionConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "FileResolutionConfig::default_max_concurrent")]
    pub max_concurrent: usize,
    #[validate(nested)]
    #[serde(default)]
    pub retry: RetryConfig,
    #[validate(nested)]
    #[serde(default)]
    pub cache: FileCacheConfig,
    #[validate(nested)]
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub per_domain_overrides: HashMap<String, Vec<String>>,
    #[serde(default = "FileResolutionConfig::default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,
    #[serde(default)]
    pub block_private_ips: bool,
    #[serde(default = "FileResolutionConfig::default_user_agent")]
    pub user_agent: String,
    #[serde(default = "FileResolutionConfig::default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for FileResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_extensions: Self::default_extensions(),
            timeout_ms: Self::default_timeout_ms(),
            max_concurrent: Self::default_max_concurrent(),
            retry: RetryConfig::default(),
            cache: FileCacheConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            per_domain_overrides: HashMap::new(),
            allowed_content_types: Self::default_allowed_content_types(),
            block_private_ips: true,
            user_agent: Self::default_user_agent(),
            max_file_size: Self::default_max_file_size(),
        }
    }
}

impl FileResolutionConfig {
    fn default_true() -> bool {
        true
    }
    fn default_extensions() -> Vec<String> {
        vec!["html".to_string(), "md".to_string()]
    }
    fn default_timeout_ms() -> u64 {
        2_000
    }
    fn default_max_concurrent() -> usize {
        32
    }
    fn default_allowed_content_types() -> Vec<String> {
        vec![
            "text/html".to_string(),
            "text/markdown".to_string(),
            "text/csv".to_string(),
            "application/json".to_string(),
            "application/xml".to_string(),
            "text/plain".to_string(),
        ]
    }
    fn default_user_agent() -> String {
        "brinkcdn-file-resolver/1.0".to_string()
    }
    fn default_max_file_size() -> u64 {
        10 * 1024 * 1024
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct UrlTransformConfig {
    #[serde(default = "UrlTransformConfig::default_true")]
    pub enabled: bool,
    #[serde(default = "UrlTransformConfig::default_true")]
    pub transform_html: bool,
    #[serde(default = "UrlTransformConfig::default_true")]
    pub transform_js: bool,
    #[serde(default = "UrlTransformConfig::default_true")]
    pub transform_css: bool,
    #[serde(default = "UrlTransformConfig::default_true")]
    pub transform_inline: bool,
    #[serde(default)]
    pub transform_data: bool,
    #[serde(default = "UrlTransformConfig::default_true")]
    pub preserve_fragments: bool,
    #[serde(default = "UrlTransformConfig::default_true")]
    pub preserve_query: bool,
    #[serde(default = "UrlTransformConfig::default_max_content_size")]
    pub max_content_size: u64,
    #[serde(default = "UrlTransformConfig::default_max_cache_size")]
    pub max_cache_size: usize,
    #[serde(default)]
    pub debug: bool,
}

impl Default for UrlTransformConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transform_html: true,
            transform_js: true,
            transform_css: true,
            transform_inline: true,
            transform_data: false,
            preserve_fragments: true,
            preserve_query: true,
            max_content_size: Self::default_max_content_size(),
            max_cache_size: Self::default_max_cache_size(),
            debug: false,
        }
    }
}

impl UrlTransformConfig {
    fn default_true() -> bool {
        true
    }
    fn default_max_content_size() -> u64 {
        5 * 1024 * 1024
    }
    fn default_max_cache_size() -> usize {
        10_000
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct TransformersConfig {
    #[serde(default = "TransformersConfig::default_true")]
    pub markdown: bool,
    #[serde(default = "TransformersConfig::default_true")]
    pub csv: bool,
    #[serde(default = "TransformersConfig::default_true")]
    pub json: bool,
    #[serde(default = "TransformersConfig::default_true")]
    pub xml: bool,
    #[serde(default = "TransformersConfig::default_true")]
    pub plain_text: bool,
    #[serde(default)]
    pub minify_html: bool,
}

impl Default for TransformersConfig {
    fn default() -> Self {
        Self {
            markdown: true,
            csv: true,
            json: true,
            xml: true,
            plain_text: true,
            minify_html: false,
        }
    }
}

impl TransformersConfig {
    fn default_true() -> bool {
        true
    }
}

/// Pre-compiled regex cache for wildcard domain patterns (`*.example.com`),
/// same "compile once into a static" idiom the teacher uses for
/// `NODE_KEY_REGEX`.
pub static WILDCARD_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^.]+").unwrap());

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
server:
  listeners:
    - address: 0.0.0.0:8080
  admin:
    address: 127.0.0.1:9090
    api_key: secret

routes:
  - id: "1"
    domain_pattern: "ddt.example"
    backend:
      host: "origin.example"
      use_tls: true
    path_prefix: "/ddt"
"#
    }

    #[test]
    fn loads_minimal_config() {
        let conf = Config::from_yaml(sample_yaml()).unwrap();
        assert_eq!(conf.server.listeners.len(), 1);
        assert_eq!(conf.routes.len(), 1);
        assert_eq!(conf.routes[0].backend.host, "origin.example");
        assert_eq!(conf.cache.default_ttl_secs, 300);
    }

    #[test]
    fn rejects_duplicate_route_ids() {
        let yaml = format!(
            "{}\n  - id: \"1\"\n    domain_pattern: \"other.example\"\n    backend:\n      host: \"b\"\n",
            sample_yaml()
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn listener_requires_tls_for_h2() {
        let listener = Listener {
            address: "0.0.0.0:443".parse().unwrap(),
            tls: None,
            offer_h2: true,
            offer_h2c: false,
        };
        assert!(listener.validate().is_err());
    }
}
