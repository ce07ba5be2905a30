//! Error handling and plain-text error responses for the gateway

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Response type produced by every pipeline stage
pub type HttpResponse = Response<Full<Bytes>>;

/// Header naming the gateway error code on error responses
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Request body could not be decoded
    BadRequest,
    /// Missing config, function, module or asset
    NotFound,
    /// Function exists but declares another method
    MethodNotAllowed,
    /// Request body exceeded the configured limit
    PayloadTooLarge,
    /// Tenant is mid-initialization
    TenantInitializing,
    /// Tenant configuration could not be loaded
    TenantInitFailure,
    /// A repository fetch failed (as opposed to the file being absent)
    UpstreamUnavailable,
    /// Uncaught error inside a server function or stage
    HandlerException,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayErrorCode::TenantInitializing => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::TenantInitFailure => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::HandlerException => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            GatewayErrorCode::TenantInitializing => "TENANT_INITIALIZING",
            GatewayErrorCode::TenantInitFailure => "TENANT_INIT_FAILURE",
            GatewayErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            GatewayErrorCode::HandlerException => "HANDLER_EXCEPTION",
        }
    }
}

/// Create a plain-text error response with X-Gateway-Error header
pub fn error_response(code: GatewayErrorCode, message: impl Into<Bytes>) -> HttpResponse {
    Response::builder()
        .status(code.status_code())
        .header("content-type", "text/plain")
        .header(X_GATEWAY_ERROR, code.as_header_value())
        .body(Full::new(message.into()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Helper to create a simple text response - infallible with valid StatusCode
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Helper to create a response without a body
pub fn empty_response(status: StatusCode) -> HttpResponse {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum")
}

/// Failure fetching from a repository provider.
///
/// Absence is not an error: providers report a missing file as `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid content from {location}: {reason}")]
    InvalidContent { location: String, reason: String },
    #[error("invalid repository path '{0}'")]
    InvalidPath(String),
}

/// Failure bootstrapping a tenant
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("tenant '{0}' is not registered")]
    TenantNotRegistered(String),
    #[error("tenant '{0}' does not specify an application")]
    ApplicationNotSpecified(String),
    #[error("application '{0}' is not registered")]
    ApplicationNotFound(String),
    #[error("repo provider '{0}' is not a registered provider")]
    UnknownProvider(String),
    #[error("invalid {what} configuration: {source}")]
    InvalidConfig {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Failure importing a server module
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("module not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Failure decoding a request body for a server function
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid form body: {0}")]
    InvalidForm(String),
}

/// Assertion failure raised by test suites
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct AssertionError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            GatewayErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayErrorCode::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            GatewayErrorCode::TenantInitializing.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayErrorCode::TenantInitFailure.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayErrorCode::UpstreamUnavailable.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_headers() {
        let response = error_response(GatewayErrorCode::TenantInitializing, "initializing");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(
            response.headers().get(X_GATEWAY_ERROR).unwrap(),
            "TENANT_INITIALIZING"
        );
    }

    #[test]
    fn test_error_code_header_values() {
        assert_eq!(
            GatewayErrorCode::MissingHostHeader.as_header_value(),
            "MISSING_HOST_HEADER"
        );
        assert_eq!(
            GatewayErrorCode::HandlerException.as_header_value(),
            "HANDLER_EXCEPTION"
        );
    }

    #[test]
    fn test_init_error_messages() {
        let err = InitError::TenantNotRegistered("example.com".to_string());
        assert_eq!(err.to_string(), "tenant 'example.com' is not registered");

        let err = InitError::from(RepoError::InvalidPath("../etc".to_string()));
        assert_eq!(err.to_string(), "invalid repository path '../etc'");
    }
}
