//! HTTP handlers for webhook endpoint management.
//!
//! Merchants register, list, and delete the endpoints that receive
//! signed event deliveries, and can rotate an endpoint's signing secret.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::auth::AuthContext;
use crate::models::webhook::{WebhookDelivery, WebhookEndpointRequest, WebhookEndpointResponse};
use crate::services::webhooks;
use crate::state::AppState;

/// Register a new webhook endpoint.
///
/// # Request Body
///
/// ```json
/// {
///   "url": "https://example.com/webhook",
///   "events": ["payment.*"]
/// }
/// ```
///
/// # Response
///
/// Returns 201 Created. The signing `secret` is only returned here, at
/// creation time.
pub async fn create_webhook(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<WebhookEndpointRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_scope("write:webhooks")?;

    let endpoint = webhooks::create_endpoint(&state.pool, auth.merchant_uuid, request).await?;

    Ok((StatusCode::CREATED, Json(endpoint)))
}

/// List all active webhook endpoints (secrets excluded).
pub async fn list_webhooks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<WebhookEndpointResponse>>, AppError> {
    auth.require_scope("read:webhooks")?;

    let endpoints = webhooks::list_endpoints(&state.pool, auth.merchant_uuid).await?;

    Ok(Json(endpoints))
}

/// Delete a webhook endpoint (soft delete).
///
/// Sets `is_active = false`, preserving delivery history. Returns 204
/// on success, 404 if the endpoint does not exist or belongs to another
/// merchant.
pub async fn delete_webhook(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(webhook_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    auth.require_scope("write:webhooks")?;

    webhooks::delete_endpoint(&state.pool, auth.merchant_uuid, webhook_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// List recent delivery attempts for a webhook endpoint.
///
/// Includes pending retries and permanently failed deliveries, newest
/// first, capped at 100 rows.
pub async fn list_webhook_deliveries(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(webhook_id): Path<Uuid>,
) -> Result<Json<Vec<WebhookDelivery>>, AppError> {
    auth.require_scope("read:webhooks")?;

    let deliveries =
        webhooks::list_deliveries(&state.pool, auth.merchant_uuid, webhook_id).await?;

    Ok(Json(deliveries))
}

/// Rotate a webhook endpoint's signing secret.
///
/// The new secret is returned exactly once. Deliveries signed with the
/// old secret stop verifying immediately.
pub async fn rotate_webhook_secret(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(webhook_id): Path<Uuid>,
) -> Result<Json<WebhookEndpointResponse>, AppError> {
    auth.require_scope("write:webhooks")?;

    let endpoint = webhooks::rotate_secret(&state.pool, auth.merchant_uuid, webhook_id).await?;

    Ok(Json(endpoint))
}
