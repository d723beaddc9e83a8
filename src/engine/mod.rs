//! Per-request orchestrator: admission, routing, cache lookup, file-resolve
//! or upstream fetch, transform, cache store, client write.
//!
//! Built as a `pingora::apps::http_app::ServeHttp` service rather than
//! `pingora_proxy::ProxyHttp`: `ServeHttp::response` returns a fully-built
//! `http::Response<Vec<u8>>` which pingora only then writes downstream, so
//! the whole body is necessarily buffered before a single byte reaches the
//! client. That is exactly the guarantee the fail-closed-on-corrupt-JS
//! behavior needs and `ProxyHttp`'s streaming `response_filter` /
//! `response_body_filter` pair cannot give, since headers go out before the
//! body (and therefore decompression success) is known. Grounded on the
//! teacher's own `ServeHttp` apps (`admin::AdminHttpApp`,
//! `service::status::StatusHttpApp`) for the trait shape, and on
//! `service::http::HttpService`/`build_http_service` for the
//! config-to-running-service wiring idiom.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::{HeaderMap, Method, Response, StatusCode};
use pingora::apps::http_app::ServeHttp;
use pingora::protocols::http::ServerSession;
use pingora_http::RequestHeader;

use crate::cache::{self, CachedResponse, ResponseCache};
use crate::config::Config;
use crate::error::ProxyError;
use crate::fileresolve::FileResolver;
use crate::metrics::MetricsSink;
use crate::route::{RouteDecision, RouteResolver};
use crate::transform::TransformPipeline;

const HOP_BY_HOP: &[&str] = &[
    "connection", "keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailer",
    "transfer-encoding", "upgrade", "server", "content-length",
];

pub struct ProxyEngine {
    routes: Arc<RouteResolver>,
    cache: Arc<ResponseCache>,
    file_resolver: Arc<FileResolver>,
    transform: Arc<TransformPipeline>,
    http_client: reqwest::Client,
    cdn_name: String,
    proxy_name: String,
    cache_cfg: crate::config::CacheConfig,
    file_resolution_enabled: bool,
}

impl ProxyEngine {
    pub fn new(
        config: &Config,
        routes: Arc<RouteResolver>,
        cache: Arc<ResponseCache>,
        file_resolver: Arc<FileResolver>,
        transform: Arc<TransformPipeline>,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(256)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("upstream http client");
        Self {
            routes,
            cache,
            file_resolver,
            transform,
            http_client,
            cdn_name: config.server.cdn_name.clone(),
            proxy_name: config.server.proxy_name.clone(),
            cache_cfg: config.cache.clone(),
            file_resolution_enabled: config.file_resolution.enabled,
        }
    }

    async fn handle(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        let start = Instant::now();
        let (method, path, host) = {
            let req = http_session.req_header();
            (
                req.method.clone(),
                req.uri.path_and_query().map(|pq| pq.to_string()).unwrap_or_else(|| req.uri.path().to_string()),
                request_host(req),
            )
        };

        if !self.routes.is_allowed_host(&host) {
            MetricsSink::record_request(404, "BYPASS", start.elapsed().as_secs_f64() * 1000.0);
            return plain_response(StatusCode::NOT_FOUND, "domain not configured");
        }

        let request_path = path.split('?').next().unwrap_or(&path).to_string();
        let decision = self.routes.resolve(&host, &request_path, method.as_str());
        if !decision.matched && decision.fallback_used {
            MetricsSink::record_request(404, "BYPASS", start.elapsed().as_secs_f64() * 1000.0);
            return plain_response(StatusCode::NOT_FOUND, "route rejected by fallback policy");
        }

        let accept_encoding = header_value(http_session, "accept-encoding");
        let accept_language = primary_language(&header_value(http_session, "accept-language"));
        let key = cache::cache_key(method.as_str(), &host, &request_path, &decision, &[], &accept_encoding, &accept_language);

        if matches!(method, Method::GET | Method::HEAD) {
            if let Some(hit) = self.cache.get(&key) {
                MetricsSink::record_request(hit.status as u16, "HIT", start.elapsed().as_secs_f64() * 1000.0);
                return self.write_from_cache(hit, &method, &request_path);
            }
        }

        let extension = extensionless_candidate(&decision.upstream_path).filter(|_| self.file_resolution_enabled && matches!(method, Method::GET | Method::HEAD));
        let incoming_via = header_value(http_session, "via");

        let fetch_start = Instant::now();
        let result = if extension.is_some() {
            self.try_file_resolve_then_fetch(&decision, &request_path, &host, &method, &incoming_via).await
        } else {
            self.fetch_upstream(&decision, &request_path, &method, &host, None, &incoming_via).await
        };
        MetricsSink::record_stage("fetch", fetch_start.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok((status, headers, body, extension_hint)) => {
                self.finish(status, headers, body, extension_hint, &method, &host, &request_path, &decision, key, start).await
            }
            Err(e) => {
                let status = status_for_transport(&e);
                log::warn!("upstream request failed: {e}");
                MetricsSink::record_request(status.as_u16(), "MISS", start.elapsed().as_secs_f64() * 1000.0);
                plain_response(status, &e.to_string())
            }
        }
    }

    async fn try_file_resolve_then_fetch(
        &self,
        decision: &RouteDecision,
        request_path: &str,
        host: &str,
        method: &Method,
        incoming_via: &str,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>, Option<String>), ProxyError> {
        let scheme = if decision.use_tls { "https" } else { "http" };
        let base_url = format!("{scheme}://{}{}", decision.backend_host, decision.upstream_path);
        let resolution = self.file_resolver.resolve(&base_url, host, &decision.backend_host).await;

        if resolution.success {
            if let Some(url) = &resolution.resolved_url {
                let (status, headers, body) = self.fetch_url(url, method, decision, host, request_path, incoming_via).await?;
                return Ok((status, headers, body, resolution.extension));
            }
        }
        self.fetch_upstream(decision, request_path, method, host, None, incoming_via).await
    }

    async fn fetch_upstream(
        &self,
        decision: &RouteDecision,
        request_path: &str,
        method: &Method,
        host: &str,
        extension_hint: Option<String>,
        incoming_via: &str,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>, Option<String>), ProxyError> {
        let scheme = if decision.use_tls { "https" } else { "http" };
        let url = format!("{scheme}://{}{}", decision.backend_host, decision.upstream_path);
        let (status, headers, body) = self.fetch_url(&url, method, decision, host, request_path, incoming_via).await?;
        Ok((status, headers, body, extension_hint))
    }

    async fn fetch_url(
        &self,
        url: &str,
        method: &Method,
        decision: &RouteDecision,
        host: &str,
        request_path: &str,
        incoming_via: &str,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>), ProxyError> {
        let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
        let via = if incoming_via.is_empty() { format!("1.1 {}", self.cdn_name) } else { format!("{incoming_via}, 1.1 {}", self.cdn_name) };
        let mut builder = self.http_client.request(reqwest_method, url);
        builder = builder
            .header("X-Forwarded-Host", host)
            .header("X-Forwarded-Proto", if decision.use_tls { "https" } else { "http" })
            .header("X-Proxy-Name", self.proxy_name.clone())
            .header("Via", via);
        if request_path != decision.upstream_path {
            builder = builder.header("X-Original-Path", request_path).header("X-Transformed-Path", decision.upstream_path.clone());
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();
        Ok((status, headers, body))
    }

    async fn finish(
        &self,
        status: StatusCode,
        headers: HeaderMap,
        body: Vec<u8>,
        extension_hint: Option<String>,
        method: &Method,
        host: &str,
        request_path: &str,
        decision: &RouteDecision,
        cache_key: String,
        start: Instant,
    ) -> Response<Vec<u8>> {
        let content_type = headers.get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("application/octet-stream").to_string();
        let content_encoding = headers.get("content-encoding").and_then(|v| v.to_str().ok()).map(|s| s.to_string());

        let rewrite = PathRewrite::new(request_path, &decision.upstream_path);
        let forwarded = forwarded_headers(&headers);

        if status == StatusCode::NOT_FOUND && wants_script_or_style(request_path, &content_type, &headers) {
            let (body, ct) = script_style_404(request_path);
            return finalize_response(StatusCode::NOT_FOUND, ct, body, method, host, &self.cdn_name, "MISS", &decision.backend_host, &rewrite, &[]);
        }

        let protocol = if decision.use_tls { "https" } else { "http" };
        let outcome = match self.transform.run(
            body,
            &content_type,
            content_encoding.as_deref(),
            extension_hint.as_deref(),
            host,
            protocol,
            request_path,
        ) {
            Ok(outcome) => outcome,
            Err(ProxyError::DecompressionFatal(msg)) => {
                log::warn!("fatal decompression failure for {request_path}: {msg}");
                MetricsSink::record_request(502, "MISS", start.elapsed().as_secs_f64() * 1000.0);
                return plain_response(StatusCode::BAD_GATEWAY, "upstream returned corrupted content");
            }
            Err(e) => {
                log::warn!("transform stage failed, serving original bytes: {e}");
                crate::transform::TransformOutcome {
                    body: Vec::new(),
                    content_type: content_type.clone(),
                    content_encoding: content_encoding.clone(),
                    modified: false,
                    transformer: None,
                }
            }
        };

        let extra_headers = transform_headers(extension_hint.as_deref(), &outcome);

        if self.is_cacheable(method, status, &outcome.content_type, &headers) {
            let ttl = ttl_from_headers(&headers, self.cache_cfg.default_ttl_secs);
            let mut stored_headers = forwarded.clone();
            stored_headers.push(("content-type".to_string(), outcome.content_type.clone()));
            stored_headers.extend(extra_headers.clone());
            let cached = CachedResponse {
                status: status.as_u16(),
                headers: stored_headers,
                body: outcome.body.clone(),
                original_content_encoding: outcome.content_encoding.clone(),
                stored_at: Instant::now(),
                expires_at: Instant::now(),
                route_decision: decision.clone(),
            };
            self.cache.put(cache_key, cached, Duration::from_secs(ttl));
        }

        MetricsSink::record_request(status.as_u16(), "MISS", start.elapsed().as_secs_f64() * 1000.0);
        let resp = finalize_response(status, outcome.content_type, outcome.body, method, host, &self.cdn_name, "MISS", &decision.backend_host, &rewrite, &forwarded);
        apply_extra_headers(resp, &extra_headers)
    }

    fn write_from_cache(&self, cached: CachedResponse, method: &Method, request_path: &str) -> Response<Vec<u8>> {
        let status = StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
        let rewrite = PathRewrite::new(request_path, &cached.route_decision.upstream_path);
        let mut builder = Response::builder().status(status);
        for (name, value) in &cached.headers {
            builder = builder.header(name, value);
        }
        builder = builder
            .header("X-Served-By", &self.proxy_name)
            .header("X-Cache", "HIT")
            .header("X-Cache-Backend", &cached.route_decision.backend_host)
            .header("X-Content-Type-Options", "nosniff")
            .header("X-XSS-Protection", "1; mode=block")
            .header("X-Frame-Options", "SAMEORIGIN")
            .header("Origin-Agent-Cluster", "?1")
            .header("X-Path-Rewrite-Applied", if rewrite.applied { "true" } else { "false" });
        if rewrite.applied {
            builder = builder.header("X-Original-Path", rewrite.original.clone()).header("X-Transformed-Path", rewrite.transformed.clone());
        }
        if let Some(ce) = &cached.original_content_encoding {
            builder = builder.header("Content-Encoding", ce);
        }
        let body = if *method == Method::HEAD { Vec::new() } else { cached.body };
        builder.body(body).unwrap_or_else(|e| {
            log::error!("failed to build cached response: {e}");
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        })
    }

    fn is_cacheable(&self, method: &Method, status: StatusCode, content_type: &str, headers: &HeaderMap) -> bool {
        if !matches!(*method, Method::GET | Method::HEAD) {
            return false;
        }
        if !self.cache_cfg.cacheable_status_codes.contains(&status.as_u16()) {
            return false;
        }
        if self.cache_cfg.respect_cache_control {
            if let Some(cc) = headers.get("cache-control").and_then(|v| v.to_str().ok()) {
                let cc = cc.to_ascii_lowercase();
                if cc.contains("no-store") {
                    return false;
                }
                if cc.contains("private") && !self.cache_cfg.cache_cookies {
                    return false;
                }
            }
        }
        if !self.cache_cfg.cache_cookies && headers.get("set-cookie").is_some() {
            return false;
        }
        self.cache_cfg
            .cacheable_content_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}

/// Distinguishes timeouts (504) from other transport failures (502), per §7.
/// `ProxyError::UpstreamTransport` collapses both into one variant, so the
/// distinction is recovered here from the message `reqwest::Error::from`
/// produced it from.
fn status_for_transport(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::UpstreamTransport(msg) if msg.to_lowercase().contains("timed out") || msg.to_lowercase().contains("timeout") => {
            StatusCode::GATEWAY_TIMEOUT
        }
        other => crate::error::status_for(other),
    }
}

fn ttl_from_headers(headers: &HeaderMap, default_ttl: u64) -> u64 {
    headers
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .and_then(|cc| {
            cc.split(',').find_map(|directive| {
                let directive = directive.trim();
                directive.strip_prefix("max-age=").and_then(|n| n.parse::<u64>().ok())
            })
        })
        .unwrap_or(default_ttl)
}

fn strip_hop_by_hop(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect()
}

/// Upstream headers safe to pass through verbatim: hop-by-hop and framing
/// headers stripped, plus `content-type`/`content-encoding`/`vary` since
/// those are always set explicitly by the caller.
fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    strip_hop_by_hop(headers)
        .into_iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("content-type")
                && !name.eq_ignore_ascii_case("content-encoding")
                && !name.eq_ignore_ascii_case("vary")
        })
        .collect()
}

/// Whether routing rewrote the client-facing path before fetching upstream,
/// and the before/after values, surfaced on both the upstream request and
/// the client response.
struct PathRewrite {
    applied: bool,
    original: String,
    transformed: String,
}

impl PathRewrite {
    fn new(request_path: &str, upstream_path: &str) -> Self {
        Self { applied: request_path != upstream_path, original: request_path.to_string(), transformed: upstream_path.to_string() }
    }
}

#[allow(clippy::too_many_arguments)]
fn finalize_response(
    status: StatusCode,
    content_type: String,
    body: Vec<u8>,
    method: &Method,
    host: &str,
    cdn_name: &str,
    cache_state: &str,
    backend: &str,
    rewrite: &PathRewrite,
    forwarded: &[(String, String)],
) -> Response<Vec<u8>> {
    let body = if *method == Method::HEAD { Vec::new() } else { body };
    let mut builder = Response::builder().status(status);
    for (name, value) in forwarded {
        builder = builder.header(name, value);
    }
    builder = builder
        .header("Content-Type", content_type)
        .header("X-Served-By", cdn_name)
        .header("X-Cache", cache_state)
        .header("X-Cache-Backend", backend)
        .header("X-Content-Type-Options", "nosniff")
        .header("X-XSS-Protection", "1; mode=block")
        .header("X-Frame-Options", "SAMEORIGIN")
        .header("Origin-Agent-Cluster", "?1")
        .header("Vary", "Accept-Encoding")
        .header("X-Path-Rewrite-Applied", if rewrite.applied { "true" } else { "false" });
    if rewrite.applied {
        builder = builder.header("X-Original-Path", rewrite.original.clone()).header("X-Transformed-Path", rewrite.transformed.clone());
    }
    builder.body(body).unwrap_or_else(|e| {
        log::error!("failed to build response for {host}: {e}");
        plain_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })
}

/// `X-File-Extension` / `X-Content-Transformed` / `X-Transformer`, emitted
/// whenever file resolution or a content transformer ran.
fn transform_headers(extension_hint: Option<&str>, outcome: &crate::transform::TransformOutcome) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if let Some(ext) = extension_hint {
        headers.push(("x-file-extension".to_string(), ext.to_string()));
    }
    if let Some(name) = &outcome.transformer {
        headers.push(("x-content-transformed".to_string(), "true".to_string()));
        headers.push(("x-transformer".to_string(), name.clone()));
    }
    headers
}

fn apply_extra_headers(mut response: Response<Vec<u8>>, extra: &[(String, String)]) -> Response<Vec<u8>> {
    for (name, value) in extra {
        if let (Ok(name), Ok(value)) = (http::HeaderName::from_bytes(name.as_bytes()), http::HeaderValue::from_str(value)) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

fn plain_response(status: StatusCode, message: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(message.as_bytes().to_vec())
        .unwrap_or_else(|_| Response::new(message.as_bytes().to_vec()))
}

fn script_style_404(path: &str) -> (Vec<u8>, String) {
    if path.ends_with(".css") {
        (b"/* resource not found */".to_vec(), "text/css".to_string())
    } else {
        (b"// resource not found".to_vec(), "application/javascript".to_string())
    }
}

fn wants_script_or_style(path: &str, content_type: &str, headers: &HeaderMap) -> bool {
    if path.ends_with(".js") || path.ends_with(".mjs") || path.ends_with(".css") {
        return true;
    }
    if content_type.starts_with("application/javascript") || content_type.starts_with("text/css") {
        return true;
    }
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|a| a.contains("javascript") || a.contains("css"))
        .unwrap_or(false)
}

fn extensionless_candidate(path: &str) -> Option<()> {
    let last_segment = path.rsplit('/').next().unwrap_or("");
    if last_segment.contains('.') {
        None
    } else {
        Some(())
    }
}

/// Prefers the URI host, falls back to the `Host` header; strips any port.
/// Mirrors `utils::request::get_request_host`'s precedence.
fn request_host(req: &RequestHeader) -> String {
    let raw = req
        .uri
        .host()
        .filter(|h| !h.is_empty())
        .map(|h| h.to_string())
        .or_else(|| req.headers.get(http::header::HOST).and_then(|v| v.to_str().ok()).map(|s| s.to_string()))
        .unwrap_or_default();
    raw.split(':').next().unwrap_or(&raw).to_string()
}

fn header_value(session: &ServerSession, name: &str) -> String {
    session
        .req_header()
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn primary_language(accept_language: &str) -> String {
    accept_language
        .split(',')
        .next()
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

#[async_trait]
impl ServeHttp for ProxyEngine {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);
        self.handle(http_session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(http::HeaderName::from_bytes(k.as_bytes()).unwrap(), HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    #[test]
    fn extensionless_candidate_ignores_paths_with_a_dot() {
        assert!(extensionless_candidate("/notes/latest").is_some());
        assert!(extensionless_candidate("/notes/readme.md").is_none());
        assert!(extensionless_candidate("/").is_some());
    }

    #[test]
    fn ttl_from_headers_prefers_max_age_over_default() {
        let headers = headers_with(&[("cache-control", "public, max-age=120")]);
        assert_eq!(ttl_from_headers(&headers, 300), 120);
    }

    #[test]
    fn ttl_from_headers_falls_back_to_default_without_max_age() {
        let headers = headers_with(&[]);
        assert_eq!(ttl_from_headers(&headers, 300), 300);
    }

    #[test]
    fn wants_script_or_style_detects_extension_and_accept_header() {
        let headers = headers_with(&[("accept", "text/css,*/*")]);
        assert!(wants_script_or_style("/app.js", "application/octet-stream", &HeaderMap::new()));
        assert!(wants_script_or_style("/unknown", "text/css", &HeaderMap::new()));
        assert!(wants_script_or_style("/unknown", "application/octet-stream", &headers));
        assert!(!wants_script_or_style("/page.html", "text/html", &HeaderMap::new()));
    }

    #[test]
    fn status_for_transport_distinguishes_timeout_from_other_transport_errors() {
        let timeout = ProxyError::UpstreamTransport("operation timed out".to_string());
        let refused = ProxyError::UpstreamTransport("connection refused".to_string());
        assert_eq!(status_for_transport(&timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for_transport(&refused), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn primary_language_takes_first_tag_without_quality() {
        assert_eq!(primary_language("en-US;q=0.9, fr;q=0.8"), "en-US");
        assert_eq!(primary_language(""), "");
    }

    fn engine_for_cache_tests(cache_cfg: crate::config::CacheConfig) -> ProxyEngine {
        let mut config = Config::default();
        config.cache = cache_cfg;
        let routes = Arc::new(RouteResolver::new(&config));
        let cache = Arc::new(ResponseCache::new(100, 3600, 60));
        let file_resolver = Arc::new(FileResolver::new(config.file_resolution.clone()));
        let transform = Arc::new(TransformPipeline::new(&config, Default::default()));
        ProxyEngine::new(&config, routes, cache, file_resolver, transform)
    }

    #[test]
    fn is_cacheable_rejects_non_get_head_methods() {
        let engine = engine_for_cache_tests(crate::config::CacheConfig::default());
        let headers = HeaderMap::new();
        assert!(!engine.is_cacheable(&Method::POST, StatusCode::OK, "text/html", &headers));
    }

    #[test]
    fn is_cacheable_respects_no_store_cache_control() {
        let engine = engine_for_cache_tests(crate::config::CacheConfig::default());
        let headers = headers_with(&[("cache-control", "no-store")]);
        assert!(!engine.is_cacheable(&Method::GET, StatusCode::OK, "text/html", &headers));
    }

    #[test]
    fn is_cacheable_rejects_content_type_outside_allow_list() {
        let engine = engine_for_cache_tests(crate::config::CacheConfig::default());
        let headers = HeaderMap::new();
        assert!(!engine.is_cacheable(&Method::GET, StatusCode::OK, "application/x-unlisted", &headers));
    }

    #[test]
    fn is_cacheable_accepts_plain_html_get() {
        let engine = engine_for_cache_tests(crate::config::CacheConfig::default());
        let headers = HeaderMap::new();
        assert!(engine.is_cacheable(&Method::GET, StatusCode::OK, "text/html", &headers));
    }

    #[test]
    fn strip_hop_by_hop_drops_connection_and_content_length_headers() {
        let headers = headers_with(&[("connection", "keep-alive"), ("content-length", "5"), ("etag", "\"abc\"")]);
        let stripped = strip_hop_by_hop(&headers);
        assert!(stripped.iter().all(|(k, _)| k != "connection"));
        assert!(stripped.iter().all(|(k, _)| k != "content-length"));
        assert!(stripped.iter().any(|(k, _)| k == "etag"));
    }

    #[test]
    fn finalize_response_strips_body_for_head_requests() {
        let rewrite = PathRewrite::new("/a", "/a");
        let resp = finalize_response(StatusCode::OK, "text/plain".to_string(), b"hello".to_vec(), &Method::HEAD, "cdn.example", "cdn", "MISS", "origin.example", &rewrite, &[]);
        assert!(resp.body().is_empty());
    }

    #[test]
    fn finalize_response_surfaces_path_rewrite_headers_when_applied() {
        let rewrite = PathRewrite::new("/notes/a.html", "/ddt/notes/a.html");
        let resp = finalize_response(StatusCode::OK, "text/html".to_string(), b"hi".to_vec(), &Method::GET, "ddt.example", "cdn", "MISS", "origin.example", &rewrite, &[]);
        assert_eq!(resp.headers().get("x-path-rewrite-applied").unwrap(), "true");
        assert_eq!(resp.headers().get("x-original-path").unwrap(), "/notes/a.html");
        assert_eq!(resp.headers().get("x-transformed-path").unwrap(), "/ddt/notes/a.html");
    }

    #[test]
    fn transform_headers_reports_extension_and_transformer_name() {
        let outcome = crate::transform::TransformOutcome {
            body: b"<h1>Hi</h1>".to_vec(),
            content_type: "text/html".to_string(),
            content_encoding: None,
            modified: true,
            transformer: Some("markdown".to_string()),
        };
        let headers = transform_headers(Some("md"), &outcome);
        assert!(headers.contains(&("x-file-extension".to_string(), "md".to_string())));
        assert!(headers.contains(&("x-content-transformed".to_string(), "true".to_string())));
        assert!(headers.contains(&("x-transformer".to_string(), "markdown".to_string())));
    }

    #[test]
    fn transform_headers_omits_transformer_fields_when_none_ran() {
        let outcome = crate::transform::TransformOutcome {
            body: b"plain".to_vec(),
            content_type: "text/plain".to_string(),
            content_encoding: None,
            modified: false,
            transformer: None,
        };
        let headers = transform_headers(None, &outcome);
        assert!(headers.is_empty());
    }

    #[test]
    fn finalize_response_omits_path_rewrite_headers_when_not_applied() {
        let rewrite = PathRewrite::new("/notes/a.html", "/notes/a.html");
        let resp = finalize_response(StatusCode::OK, "text/html".to_string(), b"hi".to_vec(), &Method::GET, "plain.example", "cdn", "MISS", "origin.example", &rewrite, &[]);
        assert_eq!(resp.headers().get("x-path-rewrite-applied").unwrap(), "false");
        assert!(resp.headers().get("x-original-path").is_none());
    }

    #[test]
    fn finalize_response_forwards_upstream_headers_on_redirect() {
        let rewrite = PathRewrite::new("/old", "/old");
        let forwarded = vec![("location".to_string(), "/new".to_string()), ("etag".to_string(), "\"v1\"".to_string())];
        let resp = finalize_response(StatusCode::FOUND, "text/html".to_string(), Vec::new(), &Method::GET, "origin.example", "cdn", "MISS", "origin.example", &rewrite, &forwarded);
        assert_eq!(resp.headers().get("location").unwrap(), "/new");
        assert_eq!(resp.headers().get("etag").unwrap(), "\"v1\"");
    }

    #[test]
    fn forwarded_headers_excludes_framing_and_explicit_headers() {
        let headers = headers_with(&[
            ("content-length", "123"),
            ("content-type", "text/plain"),
            ("content-encoding", "gzip"),
            ("vary", "Origin"),
            ("location", "/new"),
            ("connection", "keep-alive"),
        ]);
        let forwarded = forwarded_headers(&headers);
        assert!(forwarded.iter().any(|(k, _)| k == "location"));
        assert!(forwarded.iter().all(|(k, _)| k != "content-length"));
        assert!(forwarded.iter().all(|(k, _)| k != "content-type"));
        assert!(forwarded.iter().all(|(k, _)| k != "content-encoding"));
        assert!(forwarded.iter().all(|(k, _)| k != "vary"));
        assert!(forwarded.iter().all(|(k, _)| k != "connection"));
    }
}
