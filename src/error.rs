//! Typed error taxonomy shared by every data-plane component.
//!
//! Internal code returns `ProxyResult<T>` so call sites stay independent of
//! pingora's error type; the `From` impl below is the single place that
//! boundary gets crossed, at the edge of a `ServeHttp`/`Service` method.

use std::fmt;

#[derive(Debug)]
pub enum ProxyError {
    /// Malformed request or a host outside the configured allow-list.
    Client(String),
    /// Connect refused, reset, or timed out talking to an origin.
    UpstreamTransport(String),
    /// Origin responded, but with a status this proxy must surface verbatim.
    UpstreamStatus(http::StatusCode),
    /// Decoding a compressed JavaScript body failed; fail-closed per §4.5.
    DecompressionFatal(String),
    /// Decoding a compressed non-JS body failed; original bytes pass through.
    DecompressionSoft(String),
    /// A content transformer or the URL rewriter faulted; fail-open.
    Transform(String),
    /// Response cache fault; request proceeds as a miss.
    Cache(String),
    /// File-resolver circuit is open for this backend.
    CircuitOpen,
    /// Config failed to parse or validate.
    Configuration(String),
    /// Anything else unexpected.
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Client(msg) => write!(f, "client error: {msg}"),
            ProxyError::UpstreamTransport(msg) => write!(f, "upstream transport error: {msg}"),
            ProxyError::UpstreamStatus(status) => write!(f, "upstream status: {status}"),
            ProxyError::DecompressionFatal(msg) => write!(f, "fatal decompression error: {msg}"),
            ProxyError::DecompressionSoft(msg) => write!(f, "soft decompression error: {msg}"),
            ProxyError::Transform(msg) => write!(f, "transform error: {msg}"),
            ProxyError::Cache(msg) => write!(f, "cache error: {msg}"),
            ProxyError::CircuitOpen => write!(f, "circuit open"),
            ProxyError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            ProxyError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::UpstreamTransport(e.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ProxyError::UpstreamTransport(e.to_string())
        } else {
            ProxyError::Internal(e.to_string())
        }
    }
}

impl From<ProxyError> for Box<pingora_error::Error> {
    fn from(err: ProxyError) -> Self {
        use pingora_error::ErrorType;
        let etype = match &err {
            ProxyError::Client(_) => ErrorType::InvalidHTTPHeader,
            ProxyError::UpstreamTransport(_) => ErrorType::ConnectTimedout,
            ProxyError::UpstreamStatus(_) => ErrorType::HTTPStatus(0),
            ProxyError::DecompressionFatal(_) | ProxyError::DecompressionSoft(_) => {
                ErrorType::ReadError
            }
            ProxyError::Transform(_) => ErrorType::InternalError,
            ProxyError::Cache(_) => ErrorType::InternalError,
            ProxyError::CircuitOpen => ErrorType::ConnectionClosed,
            ProxyError::Configuration(_) => ErrorType::InternalError,
            ProxyError::Internal(_) => ErrorType::InternalError,
        };
        pingora_error::Error::explain(etype, err.to_string())
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Attaches a short, human-readable context to an error while preserving its kind-ness.
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> ProxyResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> ProxyResult<T> {
        self.map_err(|e| ProxyError::Internal(format!("{context}: {e}")))
    }
}

/// Maps a failure kind to the status code the client should see, per §7.
pub fn status_for(err: &ProxyError) -> http::StatusCode {
    use http::StatusCode;
    match err {
        ProxyError::Client(_) => StatusCode::BAD_REQUEST,
        ProxyError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
        ProxyError::UpstreamStatus(status) => *status,
        ProxyError::DecompressionFatal(_) => StatusCode::BAD_GATEWAY,
        ProxyError::DecompressionSoft(_) => StatusCode::OK,
        ProxyError::Transform(_) => StatusCode::OK,
        ProxyError::Cache(_) => StatusCode::OK,
        ProxyError::CircuitOpen => StatusCode::BAD_GATEWAY,
        ProxyError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_circuit_open_to_bad_gateway() {
        assert_eq!(status_for(&ProxyError::CircuitOpen), http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn upstream_status_is_passthrough() {
        let err = ProxyError::UpstreamStatus(http::StatusCode::NOT_FOUND);
        assert_eq!(status_for(&err), http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn display_includes_message() {
        let err = ProxyError::Transform("bad markdown".to_string());
        assert!(err.to_string().contains("bad markdown"));
    }
}
