//! Error types for FediCourier
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::federation::TransportError;

/// Application-wide error type
///
/// Delivery-specific variants map onto the federation error taxonomy:
/// transport failures are retried, `PermanentlyGone` deletes the queue row,
/// `QueueConflict` is swallowed by whoever lost the claim race, and the
/// signature variants reject inbound requests outright.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transport-level delivery failure (502)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Remote target answered 410 Gone
    #[error("Delivery target is permanently gone")]
    PermanentlyGone,

    /// Queue row was not in the state the transition expected (409)
    #[error("Queue item was claimed or completed elsewhere")]
    QueueConflict,

    /// Signing key for a local actor is missing or unusable (422)
    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(String),

    /// Date header missing or outside the accepted window (401)
    #[error("Signature expired")]
    SignatureExpired,

    /// Signature header could not be parsed (400)
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Short label used for metrics and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "database",
            AppError::Transport(_) => "transport",
            AppError::Federation(_) => "federation",
            AppError::PermanentlyGone => "gone",
            AppError::QueueConflict => "queue_conflict",
            AppError::KeyUnavailable(_) => "key_unavailable",
            AppError::SignatureExpired => "signature_expired",
            AppError::MalformedSignature(_) => "malformed_signature",
            AppError::InvalidSignature => "invalid_signature",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Unauthorized
            | AppError::InvalidSignature
            | AppError::SignatureExpired => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Validation(msg) | AppError::MalformedSignature(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::QueueConflict => (StatusCode::CONFLICT, self.to_string()),
            AppError::KeyUnavailable(_) => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            AppError::PermanentlyGone => (StatusCode::GONE, self.to_string()),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Transport(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
            "type": self.kind(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
