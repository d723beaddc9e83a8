//! Loopback HTTP surface for health, metrics export, and cache purge/stats.
//!
//! Kept close to the teacher's `AdminHttpApp`: a `matchit::Router` keyed by
//! method, the same `ApiError`/`ResponseHelper` split, the same
//! `validate_api_key`/`read_request_body` helpers. Only the endpoint set
//! changed, from etcd resource CRUD to this proxy's own operational
//! surface.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::{header, HeaderValue, Method, Response, StatusCode};
use matchit::{Match, Router};
use pingora::apps::http_app::ServeHttp;
use pingora::protocols::http::ServerSession;
use pingora::services::listening::Service;

use crate::cache::ResponseCache;
use crate::config::Admin;
use crate::fileresolve::FileResolver;
use crate::metrics::MetricsSink;
use crate::transform::TransformPipeline;

#[derive(Debug)]
enum ApiError {
    InvalidRequest(String),
    NotFound(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ApiError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl Error for ApiError {}

impl ApiError {
    fn into_response(self) -> Response<Vec<u8>> {
        match self {
            ApiError::InvalidRequest(_) => ResponseHelper::error(StatusCode::BAD_REQUEST, &self.to_string()),
            ApiError::NotFound(_) => ResponseHelper::error(StatusCode::NOT_FOUND, &self.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;
type RequestParams = BTreeMap<String, String>;

struct ResponseHelper;

impl ResponseHelper {
    fn success(body: Vec<u8>, content_type: Option<&str>) -> Response<Vec<u8>> {
        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(ct) = content_type {
            match HeaderValue::from_str(ct) {
                Ok(value) => builder = builder.header(header::CONTENT_TYPE, value),
                Err(e) => log::error!("invalid content type '{ct}': {e}"),
            }
        }
        builder.body(body).unwrap_or_else(|e| {
            log::error!("failed to build success response: {e}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(b"Internal Server Error".to_vec())
                .unwrap()
        })
    }

    fn error(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .body(message.as_bytes().to_vec())
            .unwrap_or_else(|e| {
                log::error!("failed to build error response: {e}");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(b"Internal Server Error".to_vec())
                    .unwrap()
            })
    }

    fn json<T: serde::Serialize>(value: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(value) {
            Ok(body) => Self::success(body, Some("application/json")),
            Err(e) => Self::error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }
}

/// Shared collaborators the admin surface reports on and mutates.
pub struct AdminState {
    pub cache: Arc<ResponseCache>,
    pub file_resolver: Arc<FileResolver>,
    pub transform: Arc<TransformPipeline>,
}

#[async_trait]
trait Handler {
    async fn handle(&self, state: &AdminState, session: &mut ServerSession, params: RequestParams) -> ApiResult<Response<Vec<u8>>>;
}

struct HealthHandler;

#[async_trait]
impl Handler for HealthHandler {
    async fn handle(&self, _state: &AdminState, _session: &mut ServerSession, _params: RequestParams) -> ApiResult<Response<Vec<u8>>> {
        Ok(ResponseHelper::success(b"ok".to_vec(), Some("text/plain")))
    }
}

struct MetricsHandler;

#[async_trait]
impl Handler for MetricsHandler {
    async fn handle(&self, _state: &AdminState, _session: &mut ServerSession, _params: RequestParams) -> ApiResult<Response<Vec<u8>>> {
        let body = MetricsSink::gather_text();
        Ok(ResponseHelper::success(body.into_bytes(), Some("text/plain; version=0.0.4")))
    }
}

struct CacheStatsHandler;

#[async_trait]
impl Handler for CacheStatsHandler {
    async fn handle(&self, state: &AdminState, _session: &mut ServerSession, _params: RequestParams) -> ApiResult<Response<Vec<u8>>> {
        let (hits, misses, evictions, expirations, size) = state.cache.stats();
        Ok(ResponseHelper::json(&serde_json::json!({
            "hits": hits,
            "misses": misses,
            "evictions": evictions,
            "expirations": expirations,
            "size": size,
        })))
    }
}

struct CachePurgeHandler;

#[async_trait]
impl Handler for CachePurgeHandler {
    async fn handle(&self, state: &AdminState, session: &mut ServerSession, _params: RequestParams) -> ApiResult<Response<Vec<u8>>> {
        let query = query_params(session);
        let pattern = query.get("pattern").cloned().unwrap_or_else(|| "*".to_string());
        let domain = query.get("domain").map(|s| s.as_str());
        let removed = state.cache.purge(&pattern, domain);
        Ok(ResponseHelper::json(&serde_json::json!({ "removed": removed })))
    }
}

struct FileResolutionStatsHandler;

#[async_trait]
impl Handler for FileResolutionStatsHandler {
    async fn handle(&self, state: &AdminState, _session: &mut ServerSession, _params: RequestParams) -> ApiResult<Response<Vec<u8>>> {
        let (probes, positive, negative, circuit_rejections, cache_hits) = state.file_resolver.stats();
        Ok(ResponseHelper::json(&serde_json::json!({
            "probes": probes,
            "positive": positive,
            "negative": negative,
            "circuit_rejections": circuit_rejections,
            "cache_hits": cache_hits,
        })))
    }
}

struct FileResolutionPurgeHandler;

#[async_trait]
impl Handler for FileResolutionPurgeHandler {
    async fn handle(&self, state: &AdminState, _session: &mut ServerSession, _params: RequestParams) -> ApiResult<Response<Vec<u8>>> {
        let removed = state.file_resolver.clear_cache();
        Ok(ResponseHelper::json(&serde_json::json!({ "removed": removed })))
    }
}

struct UrlTransformStatsHandler;

#[async_trait]
impl Handler for UrlTransformStatsHandler {
    async fn handle(&self, state: &AdminState, _session: &mut ServerSession, _params: RequestParams) -> ApiResult<Response<Vec<u8>>> {
        Ok(ResponseHelper::json(&serde_json::json!({
            "rewrite_cache_size": state.transform.url_rewrite_cache_len(),
        })))
    }
}

struct UrlTransformPurgeHandler;

#[async_trait]
impl Handler for UrlTransformPurgeHandler {
    async fn handle(&self, state: &AdminState, _session: &mut ServerSession, _params: RequestParams) -> ApiResult<Response<Vec<u8>>> {
        state.transform.clear_url_rewrite_cache();
        Ok(ResponseHelper::success(Vec::new(), None))
    }
}

type HttpHandler = Box<dyn Handler + Send + Sync>;

pub struct AdminHttpApp {
    config: Admin,
    state: AdminState,
    router: Router<HashMap<Method, HttpHandler>>,
}

impl AdminHttpApp {
    pub fn new(config: Admin, state: AdminState) -> Self {
        let mut this = Self {
            config,
            state,
            router: Router::new(),
        };
        this.route("/health", Method::GET, Box::new(HealthHandler))
            .route("/metrics", Method::GET, Box::new(MetricsHandler))
            .route("/api/cache/stats", Method::GET, Box::new(CacheStatsHandler))
            .route("/api/cache", Method::DELETE, Box::new(CachePurgeHandler))
            .route("/api/file-resolution/stats", Method::GET, Box::new(FileResolutionStatsHandler))
            .route("/api/file-resolution/cache", Method::DELETE, Box::new(FileResolutionPurgeHandler))
            .route("/api/url-transform/stats", Method::GET, Box::new(UrlTransformStatsHandler))
            .route("/api/url-transform/cache", Method::DELETE, Box::new(UrlTransformPurgeHandler));
        this
    }

    fn route(&mut self, path: &str, method: Method, handler: HttpHandler) -> &mut Self {
        if self.router.at(path).is_err() {
            let mut handlers = HashMap::new();
            handlers.insert(method, handler);
            self.router.insert(path, handlers).expect("route insertion should not fail");
        } else {
            let routes = self.router.at_mut(path).expect("route should exist after check");
            routes.value.insert(method, handler);
        }
        self
    }

    pub fn admin_http_service(config: Admin, state: AdminState) -> Service<Self> {
        let app = Self::new(config, state);
        let addr = app.config.address.to_string();
        let mut service = Service::new("Admin HTTP".to_string(), app);
        service.add_tcp(&addr);
        service
    }
}

#[async_trait]
impl ServeHttp for AdminHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        if validate_api_key(http_session, &self.config.api_key).is_err() {
            return ResponseHelper::error(StatusCode::FORBIDDEN, "invalid API key");
        }

        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        match self.router.at(&path) {
            Ok(Match { value, params }) => match value.get(&method) {
                Some(handler) => {
                    let params: RequestParams = params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
                    match handler.handle(&self.state, http_session, params).await {
                        Ok(resp) => resp,
                        Err(e) => e.into_response(),
                    }
                }
                None => ResponseHelper::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
            },
            Err(_) => ResponseHelper::error(StatusCode::NOT_FOUND, "not found"),
        }
    }
}

fn validate_api_key(http_session: &ServerSession, api_key: &str) -> ApiResult<()> {
    if api_key.is_empty() {
        return Ok(());
    }
    match http_session.get_header("x-api-key") {
        Some(key) if key.as_bytes() == api_key.as_bytes() => Ok(()),
        _ => Err(ApiError::InvalidRequest("must provide a valid API key".into())),
    }
}

fn query_params(session: &ServerSession) -> HashMap<String, String> {
    let query = session.req_header().uri.query().unwrap_or("");
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            if key.is_empty() {
                return None;
            }
            let value = parts.next().unwrap_or("");
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
