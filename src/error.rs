//! Error taxonomy and JSON error responses for the invocation boundary

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Response body type produced by the handler and the forwarder
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// The Address Resolver could not produce a bound address.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("listener did not report a local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Bootstrapping a backend failed. Shared by every caller that waited on the
/// same bootstrap, hence handed out as `Arc<BootstrapError>`.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("backend factory failed: {0}")]
    Factory(#[source] anyhow::Error),
    #[error("port allocation failed: {0}")]
    PortAllocation(#[source] std::io::Error),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("bootstrap did not finish within {0:?}")]
    Timeout(Duration),
    #[error("bootstrap task ended unexpectedly: {0}")]
    Aborted(String),
}

/// A single proxied exchange failed. Terminal for that exchange only.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(#[from] hyper::http::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Teardown of a cached backend failed. Logged, never surfaced to callers.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("backend listener did not close within {0:?}")]
    GracePeriodExceeded(Duration),
    #[error("backend serve task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("application shutdown hook failed: {0}")]
    Application(#[source] anyhow::Error),
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend could not be bootstrapped
    BootstrapFailed,
    /// Inbound request body could not be read
    BodyReadFailed,
    /// Inbound request body exceeded the buffer limit
    PayloadTooLarge,
    /// Dev backend never started accepting connections
    BackendNotReady,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BootstrapFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::BodyReadFailed => StatusCode::BAD_REQUEST,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::BackendNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BootstrapFailed => "BOOTSTRAP_FAILED",
            ProxyErrorCode::BodyReadFailed => "BODY_READ_FAILED",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::BackendNotReady => "BACKEND_NOT_READY",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl ForwardError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ForwardError::Timeout(_) => ProxyErrorCode::RequestTimeout,
            ForwardError::Client(_) => ProxyErrorCode::ConnectionFailed,
            ForwardError::RequestBuild(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::BootstrapFailed.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProxyErrorCode::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::BootstrapFailed, "factory said \"no\"");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"BOOTSTRAP_FAILED\""));
        assert!(json.contains("factory said \\\"no\\\""));
        assert!(json.contains("\"status\":500"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "CONNECTION_FAILED"
        );
    }

    #[test]
    fn test_forward_error_codes() {
        let timeout = ForwardError::Timeout(Duration::from_secs(1));
        assert_eq!(timeout.code(), ProxyErrorCode::RequestTimeout);
        assert!(timeout.to_string().contains("1s"));
    }

    #[test]
    fn test_bind_error_is_bootstrap_error() {
        let bind = BindError::Bind {
            port: 4242,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let err: BootstrapError = bind.into();
        assert!(matches!(err, BootstrapError::Bind(_)));
        assert!(err.to_string().contains("4242"));
    }
}
