//! Error types for Fedipost
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::federation::signature::SignatureVerdict;

/// Application-wide error type
///
/// Federation failures keep their own variants so that callers can tell a
/// forged request from an unreachable peer.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request body above the inbound limit (413)
    #[error("Payload too large")]
    PayloadTooLarge,

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// HTTP signature did not verify (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(SignatureVerdict),

    /// Handle has no ActivityPub identity (webfinger failed or no self link)
    #[error("Not federated: {0}")]
    NotFederated(String),

    /// Signing key could not be fetched or parsed (401)
    #[error("Key unresolvable: {0}")]
    KeyUnresolvable(String),

    /// Actor tried to change state it does not own (403)
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Remote inbox rejected a delivery or was unreachable
    #[error("Delivery failed: {message}")]
    DeliveryFailed {
        status: Option<u16>,
        message: String,
    },

    /// Federation switched off in configuration (404)
    #[error("Federation is disabled")]
    FederationDisabled,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit exceeded (429)
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Short machine-readable label, used for the error body and metrics
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Validation(_) => "validation",
            AppError::PayloadTooLarge => "payload_too_large",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::Federation(_) => "federation",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::NotFederated(_) => "not_federated",
            AppError::KeyUnresolvable(_) => "key_unresolvable",
            AppError::AuthorizationDenied(_) => "authorization_denied",
            AppError::DeliveryFailed { .. } => "delivery_failed",
            AppError::FederationDisabled => "federation_disabled",
            AppError::Config(_) => "config",
            AppError::RateLimited => "rate_limited",
            AppError::Internal(_) => "internal",
        }
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
            AppError::NotFound | AppError::FederationDisabled => {
                (StatusCode::NOT_FOUND, "Resource not found".to_string())
            }
            AppError::Unauthorized
            | AppError::InvalidSignature(_)
            | AppError::KeyUnresolvable(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::AuthorizationDenied(_) => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFederated(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::HttpClient(_) | AppError::DeliveryFailed { .. } => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
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

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.error_type()]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn federation_errors_map_to_expected_status() {
        let cases = [
            (
                AppError::InvalidSignature(SignatureVerdict::DigestMismatch),
                StatusCode::UNAUTHORIZED,
            ),
            (
                AppError::KeyUnresolvable("gone".to_string()),
                StatusCode::UNAUTHORIZED,
            ),
            (
                AppError::AuthorizationDenied("not yours".to_string()),
                StatusCode::FORBIDDEN,
            ),
            (AppError::PayloadTooLarge, StatusCode::PAYLOAD_TOO_LARGE),
            (AppError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (AppError::FederationDisabled, StatusCode::NOT_FOUND),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
