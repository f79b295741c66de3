//! # Error Handling
//!
//! Custom error types for the HTTP surface and how they map to responses.
//!
//! ## Error Categories:
//! - **Internal**: server-side problems (500)
//! - **BadRequest**: the client sent invalid data (400)
//! - **NotFound**: requested resource doesn't exist (404)
//! - **ConfigError**: configuration problems (500)
//! - **ValidationError**: data validation failed (400)
//! - **ModelUnavailable**: an operation needed a loaded model (503)
//!
//! All errors render as JSON with a consistent structure:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Idle timeout must be greater than 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application-level error for HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (lock poisoning, unexpected I/O, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The operation requires the recognizer model to be loaded
    ModelUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ModelUnavailable(msg) => write!(f, "Model unavailable: {}", msg),
        }
    }
}

/// Converts an [`AppError`] into the JSON HTTP response clients see.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - ModelUnavailable → 503
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::ModelUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "model_unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// `?` on an `anyhow::Error` inside a handler becomes a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing failures are almost always the client's fault, so they map
/// to 400 rather than 500.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            AppError::BadRequest("bad".into()).error_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("missing".into()).error_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::ModelUnavailable("not loaded".into())
                .error_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_display() {
        let err = AppError::ValidationError("port cannot be 0".into());
        assert_eq!(err.to_string(), "Validation error: port cannot be 0");
    }
}
