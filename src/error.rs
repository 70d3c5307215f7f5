//! Error taxonomy for agent operations and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Response body type shared by the proxy and the management API.
pub type AgentBody = BoxBody<Bytes, hyper::Error>;

/// Non-standard status answered for hostnames with no route entry.
pub const NO_RESPONSE: u16 = 444;

/// Errors surfaced by agent operations, mapped onto HTTP statuses at the
/// API boundary.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed or rejected input
    #[error("{0}")]
    Validation(String),
    /// Unknown app id, route, or process handle
    #[error("{0}")]
    NotFound(String),
    /// Missing or wrong shared secret
    #[error("unauthorized")]
    Unauthorized,
    /// Duplicate id or an operation already in flight
    #[error("{0}")]
    Conflict(String),
    /// Request body over the size cap
    #[error("request body too large")]
    TooLarge,
    /// Dependency install failed; the output is part of the message
    #[error("dependency install failed: {0}")]
    Install(String),
    /// Filesystem or process I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Anything else; detail stays in the logs
    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::Validation(_) | AgentError::Conflict(_) => StatusCode::BAD_REQUEST,
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Unauthorized => StatusCode::UNAUTHORIZED,
            AgentError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AgentError::Install(_) | AgentError::Io(_) | AgentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable code for the `error` field of responses.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Validation(_) => "validation",
            AgentError::NotFound(_) => "not_found",
            AgentError::Unauthorized => "unauthorized",
            AgentError::Conflict(_) => "conflict",
            AgentError::TooLarge => "too_large",
            AgentError::Install(_) => "install_fail",
            AgentError::Io(_) => "io",
            AgentError::Internal(_) => "internal",
        }
    }

    /// Message safe to put in a response body. I/O and internal errors keep
    /// their detail (paths, env contents) in the logs only; install output
    /// belongs to the caller and passes through.
    pub fn public_message(&self) -> String {
        match self {
            AgentError::Io(_) | AgentError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Error body returned by the management API.
#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    message: String,
    error: &'a str,
}

fn json_body(data: String) -> AgentBody {
    Full::new(Bytes::from(data))
        .map_err(|e| match e {})
        .boxed()
}

/// `{"message": ..., "error": <code>}` with the status from the taxonomy.
pub fn api_error_response(err: &AgentError) -> Response<AgentBody> {
    let body = ApiErrorBody {
        message: err.public_message(),
        error: err.code(),
    };
    let json = serde_json::to_string(&body)
        .unwrap_or_else(|_| format!(r#"{{"message":"internal error","error":"{}"}}"#, err.code()));

    Response::builder()
        .status(err.status_code())
        .header("Content-Type", "application/json")
        .body(json_body(json))
        .expect("valid response with StatusCode enum and static headers")
}

fn proxy_error_response(status: StatusCode, message: &str) -> Response<AgentBody> {
    let json = serde_json::to_string(&serde_json::json!({ "error": message }))
        .unwrap_or_else(|_| format!(r#"{{"error":"{message}"}}"#));

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(json_body(json))
        .expect("valid response with StatusCode enum and static headers")
}

/// Answer for hostnames with no route entry. The caller applies the
/// scanner-throttling delay before sending this.
pub fn no_response() -> Response<AgentBody> {
    let status = StatusCode::from_u16(NO_RESPONSE).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    proxy_error_response(status, "No response")
}

/// Answer for domains whose app is registered but not running.
pub fn service_unavailable() -> Response<AgentBody> {
    proxy_error_response(StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
}

/// Answer when forwarding to a running app fails.
pub fn bad_gateway() -> Response<AgentBody> {
    proxy_error_response(StatusCode::BAD_GATEWAY, "Bad gateway")
}
