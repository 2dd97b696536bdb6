//! Error types and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors raised while building, running or tearing down sessions
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The setup script failed for a user
    #[error("provisioning failed for user '{user}': {reason}")]
    Provisioning { user: String, reason: String },

    /// The start script could not be launched or handed back no handle
    #[error("launch failed for user '{user}': {reason}")]
    Launch { user: String, reason: String },

    /// The stop script failed for a user
    #[error("shutdown failed for user '{user}': {reason}")]
    Shutdown { user: String, reason: String },

    /// A second session was registered for the same user
    #[error("session for user '{0}' is already registered")]
    DuplicateSession(String),

    /// The OS random source failed
    #[error("failed to generate session token: {0}")]
    Randomness(String),
}

/// Error codes for request-level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Bad shared token or user not in the allow-list
    NotAuthorized,
    /// User passed the allow-list but has no session
    NoSuchSession,
    /// Path matches no route
    NotFound,
    /// Plain request to the backend failed
    BackendUnreachable,
    /// WebSocket handshake with the backend failed
    UpgradeFailed,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotAuthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::NoSuchSession => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::BackendUnreachable => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpgradeFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotAuthorized => "NOT_AUTHORIZED",
            ProxyErrorCode::NoSuchSession => "NO_SUCH_SESSION",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::UpgradeFailed => "UPGRADE_FAILED",
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
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
