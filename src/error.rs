//! # Error Handling
//!
//! This module defines the gateway's error types and how they're converted to HTTP responses.
//!
//! ## Error Categories:
//! Each failure a caller can see maps to its own status code and `type`, so a
//! monitoring client can tell "gateway reachable, worker unreachable" apart from
//! "bad request" or "worker said no":
//!
//! | Variant            | Status | `type`              | Retry?                    |
//! |--------------------|--------|---------------------|---------------------------|
//! | `ValidationError`  | 400    | `validation_error`  | no, fix the request       |
//! | `RemoteError`      | 502    | `remote_error`      | not blindly               |
//! | `TransportError`   | 503    | `transport_error`   | after broker recovers     |
//! | `TimeoutError`     | 504    | `timeout_error`     | yes, with backoff         |
//! | `Internal`         | 500    | `internal_error`    | -                         |

use crate::rpc::{BridgeError, ErrorDescriptor};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the gateway.
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::ValidationError("No audio file provided".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Server-side problems unrelated to the worker
    Internal(String),

    /// Caller sent missing or invalid input
    ValidationError(String),

    /// Worker did not reply before the deadline
    TimeoutError(String),

    /// Broker connection is unavailable
    TransportError(String),

    /// Worker replied with an explicit failure
    RemoteError(ErrorDescriptor),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::TimeoutError(msg) => write!(f, "Timeout: {}", msg),
            AppError::TransportError(msg) => write!(f, "Transport error: {}", msg),
            AppError::RemoteError(err) => write!(f, "Worker error: {}", err.message),
        }
    }
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::TimeoutError(_) => "timeout_error",
            AppError::TransportError(_) => "transport_error",
            AppError::RemoteError(_) => "remote_error",
        }
    }
}

/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "remote_error",
///     "message": "corrupt audio",
///     "timestamp": "2025-01-01T12:00:00Z",
///     "details": { "status": "error", "message": "corrupt audio" }
///   }
/// }
/// ```
/// `details` is present only for worker errors that carried a body.
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::TimeoutError(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::TransportError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RemoteError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (message, details) = match self {
            AppError::Internal(msg)
            | AppError::ValidationError(msg)
            | AppError::TimeoutError(msg)
            | AppError::TransportError(msg) => (msg.clone(), None),
            AppError::RemoteError(err) => (err.message.clone(), err.details.clone()),
        };

        let mut error = json!({
            "type": self.kind(),
            "message": message,
            "timestamp": chrono::Utc::now().to_rfc3339()
        });
        if let Some(details) = details {
            error["details"] = details;
        }

        HttpResponse::build(self.status_code()).json(json!({ "error": error }))
    }
}

/// Bridge outcomes map one-to-one onto the caller-visible categories.
impl From<BridgeError> for AppError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Timeout(_) => AppError::TimeoutError(err.to_string()),
            BridgeError::Transport(e) => AppError::TransportError(e.to_string()),
            BridgeError::Remote(descriptor) => AppError::RemoteError(descriptor),
            // Payloads are built by the gateway
            BridgeError::Encode(_) => AppError::Internal(err.to_string()),
        }
    }
}
