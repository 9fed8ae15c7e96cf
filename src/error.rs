//! Error types and HTTP error response handling.
//!
//! This module defines all application errors and how they are converted
//! into HTTP responses with appropriate status codes and machine-readable
//! JSON bodies.
//!
//! # Error Categories
//!
//! - **Credential errors**: invalid/expired keys, inactive merchants,
//!   missing scopes - surfaced with a status and code, never internals
//! - **Rate limiting**: a distinct 429 rejection carrying retry guidance
//! - **Resource errors**: requested resources not found
//! - **Validation errors**: malformed request data
//! - **Infrastructure errors**: database or chain RPC failures, always
//!   mapped to a generic 5xx body

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Application-wide error type.
///
/// Each variant maps to a specific HTTP status code and error code.
/// Validation and verification *outcomes* (e.g., an on-chain mismatch)
/// are values, not variants here - this enum is for failures that end
/// the request.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database operation failed (connection error, query error).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Chain RPC call failed on both the primary and fallback endpoint.
    #[error("Chain RPC error: {0}")]
    Rpc(String),

    /// API key is missing, malformed, unknown, or pinned to the wrong
    /// network for its merchant.
    ///
    /// Returns 401, or 403 when `forbidden` is set (network mismatch -
    /// the key exists and is real, it just must not be used here).
    #[error("Invalid API key")]
    InvalidApiKey { forbidden: bool },

    /// API key is past its `expires_at`. Returns 401.
    #[error("API key has expired")]
    ExpiredApiKey,

    /// Owning merchant is missing or not in `active` status. Returns 403.
    #[error("Merchant account is not active")]
    InactiveMerchant,

    /// Key lacks the scope required by this operation. Returns 403.
    #[error("API key does not have the required permission")]
    InsufficientPermissions,

    /// Request allowance exhausted for the current window. Returns 429
    /// with `Retry-After` and `X-RateLimit-*` headers.
    #[error("Rate limit exceeded")]
    RateLimited {
        limit: u32,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },

    /// Requested webhook endpoint does not exist or belongs to another
    /// merchant. Returns 404.
    #[error("Webhook endpoint not found")]
    WebhookNotFound,

    /// Requested payment does not exist or belongs to another merchant.
    /// Returns 404.
    #[error("Payment not found")]
    PaymentNotFound,

    /// Webhook URL failed validation. Returns 400.
    #[error("Invalid webhook URL")]
    InvalidWebhookUrl(String),

    /// Request body or parameters are invalid. Returns 400.
    #[error("Invalid request")]
    InvalidRequest(String),
}

impl AppError {
    /// The plain 401 invalid-key error.
    pub fn invalid_key() -> Self {
        AppError::InvalidApiKey { forbidden: false }
    }

    /// The 403 variant, used for key/network mismatches where the key is
    /// genuine but must not authenticate this merchant.
    pub fn key_forbidden() -> Self {
        AppError::InvalidApiKey { forbidden: true }
    }
}

/// True when a database write failed on a unique constraint (Postgres
/// `23505`).
///
/// Writes that attach a deploy hash to a payment race against the
/// `payments.deploy_hash` unique index; callers check this to turn the
/// duplicate into a domain outcome instead of a 500.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Convert AppError into an HTTP response.
///
/// # Response Format
///
/// All errors return JSON in this format:
/// ```json
/// {
///   "error": {
///     "code": "error_type",
///     "message": "Human-readable error message"
///   }
/// }
/// ```
///
/// Infrastructure errors (`Database`, `Rpc`) deliberately hide their
/// detail from the client; the full error is logged server-side.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Rate limiting carries response headers alongside the body
        if let AppError::RateLimited {
            limit,
            reset_at,
            retry_after_secs,
        } = &self
        {
            let body = Json(json!({
                "error": {
                    "code": "rate_limited",
                    "message": "Rate limit exceeded. Retry after the indicated delay."
                }
            }));
            let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert("X-RateLimit-Limit", v);
            }
            headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            if let Ok(v) = HeaderValue::from_str(&reset_at.to_rfc3339()) {
                headers.insert("X-RateLimit-Reset", v);
            }
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                headers.insert(header::RETRY_AFTER, v);
            }
            return response;
        }

        // Map each remaining variant to (HTTP status, error code, message)
        let (status, code, message) = match self {
            AppError::InvalidApiKey { forbidden } => (
                if forbidden {
                    StatusCode::FORBIDDEN
                } else {
                    StatusCode::UNAUTHORIZED
                },
                "invalid_api_key",
                self.to_string(),
            ),
            AppError::ExpiredApiKey => (
                StatusCode::UNAUTHORIZED,
                "expired_api_key",
                self.to_string(),
            ),
            AppError::InactiveMerchant => (
                StatusCode::FORBIDDEN,
                "inactive_merchant",
                self.to_string(),
            ),
            AppError::InsufficientPermissions => (
                StatusCode::FORBIDDEN,
                "insufficient_permissions",
                self.to_string(),
            ),
            AppError::WebhookNotFound => {
                (StatusCode::NOT_FOUND, "webhook_not_found", self.to_string())
            }
            AppError::PaymentNotFound => {
                (StatusCode::NOT_FOUND, "payment_not_found", self.to_string())
            }
            AppError::InvalidWebhookUrl(ref msg) => {
                (StatusCode::BAD_REQUEST, "invalid_webhook_url", msg.clone())
            }
            AppError::InvalidRequest(ref msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            AppError::Database(ref e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Rpc(ref e) => {
                tracing::error!("Chain RPC error: {e}");
                (
                    StatusCode::BAD_GATEWAY,
                    "chain_unavailable",
                    "Chain RPC is currently unavailable".to_string(),
                )
            }
            AppError::RateLimited { .. } => unreachable!("handled above"),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;

    #[derive(Debug)]
    struct FakeDbError {
        unique: bool,
    }

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.message())
        }
    }

    impl std::error::Error for FakeDbError {}

    impl DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            if self.unique {
                "duplicate key value violates unique constraint"
            } else {
                "relation does not exist"
            }
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.unique.then(|| Cow::Borrowed("23505"))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            if self.unique {
                ErrorKind::UniqueViolation
            } else {
                ErrorKind::Other
            }
        }
    }

    #[test]
    fn unique_violations_are_told_apart_from_other_failures() {
        let duplicate = sqlx::Error::Database(Box::new(FakeDbError { unique: true }));
        assert!(is_unique_violation(&duplicate));

        let other = sqlx::Error::Database(Box::new(FakeDbError { unique: false }));
        assert!(!is_unique_violation(&other));

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
