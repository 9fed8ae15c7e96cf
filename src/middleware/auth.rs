//! API key authentication and rate-limiting middleware.
//!
//! Every protected request passes through here:
//! 1. Extract the API key from the `X-CasPay-Key` header
//! 2. Validate it (hash lookup, expiry, merchant status, network match)
//! 3. Apply the fixed-window rate limit keyed `{merchant}:{operation}`
//! 4. Inject [`ValidatedMerchant`] into the request for handlers
//! 5. Stamp `X-RateLimit-*` headers onto the response
//!
//! Scope enforcement happens in each handler, which knows which
//! permission its operation requires.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, header},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::services::api_keys;
use crate::services::rate_limit::{RateLimitConfig, RateLimitDecision};
use crate::state::AppState;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-CasPay-Key";

/// Authentication + rate-limit middleware function.
///
/// # Returns
///
/// - `Ok(Response)` on success, with rate-limit headers attached
/// - `Err(AppError)` - 401/403 for credential failures, 429 when the
///   window is exhausted (carrying `Retry-After`)
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let raw_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(AppError::invalid_key)?;

    let merchant = api_keys::validate_api_key(&state.pool, raw_key, None).await?;

    // One counter per merchant and operation; reads share a looser window
    let is_read = request.method() == axum::http::Method::GET;
    let operation = if is_read { "read" } else { "write" };
    let limiter_key = format!("{}:{}", merchant.merchant_id, operation);
    let decision = if is_read {
        state
            .rate_limiter
            .check_with(&limiter_key, &RateLimitConfig::read_heavy())
            .await
    } else {
        state.rate_limiter.check(&limiter_key).await
    };

    if !decision.allowed {
        return Err(AppError::RateLimited {
            limit: decision.limit,
            reset_at: decision.reset_at,
            retry_after_secs: decision.retry_after_secs.unwrap_or(1),
        });
    }

    // Handlers extract this via Extension<ValidatedMerchant>
    request.extensions_mut().insert(merchant);

    let mut response = next.run(request).await;
    apply_rate_limit_headers(&mut response, &decision);
    Ok(response)
}

/// Stamp the standard rate-limit headers onto an outgoing response.
fn apply_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_at.to_rfc3339()) {
        headers.insert("X-RateLimit-Reset", v);
    }
    if let Some(retry_after) = decision.retry_after_secs {
        if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
            headers.insert(header::RETRY_AFTER, v);
        }
    }
}

// Re-exported so handlers can name the extension type without reaching
// into services directly.
pub use crate::services::api_keys::ValidatedMerchant as AuthContext;
