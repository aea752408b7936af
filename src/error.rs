//! # Error Handling
//!
//! This module defines the HTTP-facing error type and how it is converted to responses.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Two layers of errors
//! - **Domain errors** (`DecodeError`, `StoreError`, `EngineError`, `PipelineError`) use
//!   `thiserror` and describe what went wrong inside the service
//! - **AppError** decides what the client sees: status code, error type and message
//!
//! ### Traits for Error Conversion
//! - **From trait**: lets handlers use `?` on pipeline and multipart errors
//! - **ResponseError trait**: actix calls this to turn an error into an HTTP response
//! - **Display trait**: the human-readable message used in logs
//!
//! ## JSON Response Format:
//! Every error returns the same shape. `detail` carries the message at the top
//! level for clients that only look there (workflow tools such as n8n do):
//! ```json
//! {
//!   "detail": "unsupported audio format: \"clip.txt\" (allowed: mp3, wav, m4a, ogg, oga)",
//!   "error": {
//!     "type": "unsupported_format",
//!     "message": "unsupported audio format: \"clip.txt\" (allowed: mp3, wav, m4a, ogg, oga)",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

use crate::pipeline::PipelineError;

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Forbidden**: shared secret missing or wrong (403)
/// - **UnsupportedFormat / EmptyPayload / BadRequest**: client sent unusable input (400)
/// - **PayloadTooLarge**: upload above the configured limit (413)
/// - **Timeout**: transcription exceeded the request timeout (504)
/// - **Internal**: server-side failures (500)
#[derive(Debug)]
pub enum AppError {
    Forbidden(String),
    UnsupportedFormat(String),
    EmptyPayload(String),
    BadRequest(String),
    PayloadTooLarge(String),
    Timeout(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            AppError::EmptyPayload(msg) => write!(f, "Empty payload: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::PayloadTooLarge(msg) => write!(f, "Payload too large: {}", msg),
            AppError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            AppError::UnsupportedFormat(msg) => (StatusCode::BAD_REQUEST, "unsupported_format", msg),
            AppError::EmptyPayload(msg) => (StatusCode::BAD_REQUEST, "empty_payload", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", msg),
            AppError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, "timeout", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "detail": message,
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Pipeline outcomes map one-to-one onto client-visible errors.
impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::AuthenticationFailed => AppError::Forbidden(message),
            PipelineError::UnsupportedFormat(_) => AppError::UnsupportedFormat(message),
            PipelineError::EmptyPayload => AppError::EmptyPayload(message),
            PipelineError::PersistFailure(_) | PipelineError::EngineFailure(_) => AppError::Internal(message),
        }
    }
}

/// Malformed multipart bodies are the client's fault.
impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("malformed multipart body: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;
