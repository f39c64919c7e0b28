//! Error types for inferproxy.
//!
//! Every forwarding failure maps to exactly one [`FailureCategory`], one HTTP
//! status and one retry policy. The category string is what callers and
//! operators see in the `type` field of the error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for inferproxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Category of a forwarding failure, as reported in error bodies and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    Validation,
    NotFound,
    MethodNotAllowed,
    Connect,
    Timeout,
    UpstreamError,
    PoolExhausted,
    ShuttingDown,
    ClientDisconnect,
    Internal,
}

impl FailureCategory {
    /// Lowercase string representation for JSON bodies and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Validation => "validation",
            FailureCategory::NotFound => "not_found",
            FailureCategory::MethodNotAllowed => "method_not_allowed",
            FailureCategory::Connect => "connect",
            FailureCategory::Timeout => "timeout",
            FailureCategory::UpstreamError => "upstream_error",
            FailureCategory::PoolExhausted => "pool_exhausted",
            FailureCategory::ShuttingDown => "shutting_down",
            FailureCategory::ClientDisconnect => "client_disconnect",
            FailureCategory::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for inferproxy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("No route for path '{path}'")]
    NotFound { path: String },

    #[error("Method {method} not allowed on '{path}'")]
    MethodNotAllowed { method: String, path: String },

    #[error("Failed to connect to upstream: {0}")]
    ConnectFailure(String),

    #[error("Upstream timed out: {0}")]
    Timeout(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("Connection pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    #[error("Proxy is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Failure category of this error.
    pub fn category(&self) -> FailureCategory {
        match self {
            Error::Validation(_) | Error::BodyTooLarge { .. } => FailureCategory::Validation,
            Error::NotFound { .. } => FailureCategory::NotFound,
            Error::MethodNotAllowed { .. } => FailureCategory::MethodNotAllowed,
            Error::ConnectFailure(_) => FailureCategory::Connect,
            Error::Timeout(_) => FailureCategory::Timeout,
            Error::UpstreamProtocol(_) => FailureCategory::UpstreamError,
            Error::PoolExhausted { .. } => FailureCategory::PoolExhausted,
            Error::ShuttingDown => FailureCategory::ShuttingDown,
            Error::Config(_) | Error::Internal(_) => FailureCategory::Internal,
        }
    }

    /// HTTP status code surfaced to the caller.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Error::ConnectFailure(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::UpstreamProtocol(_) => StatusCode::BAD_GATEWAY,
            Error::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure is transient and worth one retry on a fresh connection.
    ///
    /// Only connect-phase failures qualify; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ConnectFailure(_) | Error::Timeout(_))
    }

    /// Render the structured error body, tagged with the session that produced it.
    pub fn to_body(&self, session_id: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.category().as_str(),
                "code": self.status_code().as_u16(),
                "session_id": session_id,
            }
        })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status_code(), axum::Json(self.to_body(None))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::ConnectFailure("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::Timeout("slow".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::PoolExhausted { waited_ms: 50 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::UpstreamProtocol("bad frame".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_only_connect_phase_errors_are_transient() {
        assert!(Error::ConnectFailure("refused".into()).is_transient());
        assert!(Error::Timeout("slow".into()).is_transient());

        assert!(!Error::UpstreamProtocol("bad".into()).is_transient());
        assert!(!Error::PoolExhausted { waited_ms: 10 }.is_transient());
        assert!(!Error::Validation("missing model".into()).is_transient());
        assert!(!Error::ShuttingDown.is_transient());
    }

    #[test]
    fn test_body_distinguishes_categories() {
        let connect = Error::ConnectFailure("refused".into()).to_body(Some("abc"));
        assert_eq!(connect["error"]["type"], "connect");
        assert_eq!(connect["error"]["code"], 502);
        assert_eq!(connect["error"]["session_id"], "abc");

        let timeout = Error::Timeout("slow".into()).to_body(None);
        assert_eq!(timeout["error"]["type"], "timeout");
        assert!(timeout["error"]["session_id"].is_null());

        let validation = Error::Validation("missing".into()).to_body(None);
        assert_eq!(validation["error"]["type"], "validation");
    }
}
