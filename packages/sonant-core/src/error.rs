//! Centralized error types for the Sonant Bridge core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Sonant Bridge.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum BridgeError {
    /// Configuration failed validation at startup.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Connection rejected by upgrade validation (User-Agent, auth).
    #[error("Connection rejected: {0}")]
    AuthRejected(String),

    /// Remote address exceeded the connection rate limit.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Carrier `start` frame failed validation.
    #[error("Bad start message: {0}")]
    BadStartMessage(String),

    /// Model audio event carried no recognizable payload field.
    #[error("Audio event has no payload")]
    MissingPayload,

    /// Codec input was malformed (odd length, impossible sample rate).
    #[error("Codec input error: {0}")]
    CodecInput(String),

    /// A bounded queue was full; the oldest entry was dropped.
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Send skipped because the socket reported backpressure.
    #[error("Backpressure: {buffered} bytes buffered, threshold {threshold}")]
    BackpressureSkip { buffered: usize, threshold: usize },

    /// Model RPC did not respond within the configured timeout.
    #[error("Model RPC timed out after {0} ms")]
    RpcTimeout(u64),

    /// Model stream reported an error mid-response.
    #[error("Model stream error: {0}")]
    RpcStreamError(String),

    /// Model rejected the request as invalid. Not retryable.
    #[error("Model validation error: {0}")]
    RpcValidation(String),

    /// Model throttled the request.
    #[error("Model throttled: {0}")]
    RpcThrottled(String),

    /// Model internal server error.
    #[error("Model internal error: {0}")]
    RpcInternal(String),

    /// Model denied access to the requested resource.
    #[error("Model access denied: {0}")]
    RpcAccessDenied(String),

    /// A session with this identifier already exists.
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// Requested session does not exist.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The carrier socket closed; teardown in progress.
    #[error("Socket closed")]
    SocketClosed,

    /// A handler or background task panicked.
    #[error("Internal panic: {0}")]
    InternalPanic(String),
}

impl BridgeError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::AuthRejected(_) => "auth_rejected",
            Self::RateLimited => "rate_limited",
            Self::BadStartMessage(_) => "bad_start_message",
            Self::MissingPayload => "missing_payload",
            Self::CodecInput(_) => "codec_input",
            Self::QueueFull(_) => "queue_full",
            Self::BackpressureSkip { .. } => "backpressure_skip",
            Self::RpcTimeout(_) => "rpc_timeout",
            Self::RpcStreamError(_) => "rpc_stream_error",
            Self::RpcValidation(_) => "rpc_validation",
            Self::RpcThrottled(_) => "rpc_throttled",
            Self::RpcInternal(_) => "rpc_internal",
            Self::RpcAccessDenied(_) => "rpc_access_denied",
            Self::AlreadyExists(_) => "session_already_exists",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SocketClosed => "socket_closed",
            Self::InternalPanic(_) => "internal_panic",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AuthRejected(_) => StatusCode::FORBIDDEN,
            Self::RateLimited | Self::RpcThrottled(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::BadStartMessage(_) | Self::MissingPayload | Self::CodecInput(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::ConfigInvalid(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RpcTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether an RPC initiation failure with this error is worth retrying.
    ///
    /// Validation and access errors are deterministic; timeouts, network
    /// faults, throttling and server errors are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RpcTimeout(_)
            | Self::RpcThrottled(_)
            | Self::RpcInternal(_)
            | Self::RpcStreamError(_) => true,
            Self::RpcValidation(_) | Self::RpcAccessDenied(_) => false,
            _ => false,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

/// Classifies a transport-level error message as retryable or not.
///
/// Used when the failure comes from the HTTP layer as a plain string
/// rather than an already-typed [`BridgeError`].
pub fn is_retryable_message(message: &str) -> bool {
    const RETRYABLE: &[&str] = &[
        "timeout",
        "network",
        "connection",
        "throttling",
        "service unavailable",
        "internal server error",
        "too many requests",
    ];
    let lower = message.to_ascii_lowercase();
    RETRYABLE.iter().any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_maps_to_429() {
        let err = BridgeError::RateLimited;
        assert_eq!(err.code(), "rate_limited");
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!BridgeError::RpcValidation("bad schema".into()).is_retryable());
        assert!(!BridgeError::RpcAccessDenied("no".into()).is_retryable());
        assert!(BridgeError::RpcThrottled("slow down".into()).is_retryable());
        assert!(BridgeError::RpcTimeout(5000).is_retryable());
    }

    #[test]
    fn retryable_message_classification() {
        assert!(is_retryable_message("Connection reset by peer"));
        assert!(is_retryable_message("HTTP 503 Service Unavailable"));
        assert!(is_retryable_message("request timeout"));
        assert!(!is_retryable_message("malformed event payload"));
    }

    #[test]
    fn duplicate_session_maps_to_conflict() {
        let err = BridgeError::AlreadyExists("CA123".into());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }
}
