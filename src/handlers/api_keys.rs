//! API key issuance endpoint.

use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::error::AppError;
use crate::middleware::auth::AuthContext;
use crate::models::api_key::IssueKeyRequest;
use crate::services::api_keys;
use crate::state::AppState;

/// Issue a new API key for the authenticated merchant.
///
/// # Request Body
///
/// ```json
/// {
///   "key_prefix": "live",
///   "permissions": ["read:payments", "write:payments"]
/// }
/// ```
///
/// # Response
///
/// Returns 201 Created. The plaintext `key` appears only in this
/// response; afterwards the gateway holds just its hash.
///
/// # Security
///
/// Requires a `secret`-class key carrying the `admin:keys` scope -
/// public live/test keys cannot mint new credentials.
pub async fn issue_key(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<IssueKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_scope("admin:keys")?;

    if auth.key_prefix != crate::models::api_key::KeyPrefix::Secret {
        return Err(AppError::InsufficientPermissions);
    }

    let response = api_keys::issue_api_key(&state.pool, auth.merchant_uuid, request).await?;

    Ok((StatusCode::CREATED, Json(response)))
}
