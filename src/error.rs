//! Gateway error codes, transport failures and the responses they map to

use crate::gateway::{full_body, GatewayBody};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Body of the response sent when no route matches and there is no default
pub const RESOURCE_NOT_AVAILABLE: &str = "The resource is not available";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Host matched no route and no default is configured
    ResourceNotAvailable,
    /// WebSocket upgrade without a usable handshake
    InvalidUpgrade,
    /// Backend did not respond in time
    RequestTimeout,
    /// Failed to connect to the backend
    ConnectionFailed,
    /// Any other backend transport failure
    BackendUnavailable,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::ResourceNotAvailable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::InvalidUpgrade => StatusCode::BAD_REQUEST,
            GatewayErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::ResourceNotAvailable => "RESOURCE_NOT_AVAILABLE",
            GatewayErrorCode::InvalidUpgrade => "INVALID_UPGRADE",
            GatewayErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            GatewayErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            GatewayErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
        }
    }
}

/// Failure talking to a proxied backend
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("backend did not respond within {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("failed to connect to backend: {0}")]
    ConnectionFailed(String),

    #[error("backend transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            TransportError::Timeout(_) => GatewayErrorCode::RequestTimeout,
            TransportError::ConnectionFailed(_) => GatewayErrorCode::ConnectionFailed,
            TransportError::Other(_) => GatewayErrorCode::BackendUnavailable,
        }
    }

    pub fn into_response(self) -> Response<GatewayBody> {
        json_error_response(self.code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

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

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

/// Fixed plain-text response for hosts with no route
pub fn resource_not_available() -> Response<GatewayBody> {
    let code = GatewayErrorCode::ResourceNotAvailable;
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(RESOURCE_NOT_AVAILABLE))
        .expect("valid response with StatusCode enum and static headers")
}
