//! Payment HTTP handlers.
//!
//! - `POST /api/v1/payments` - record an expected payment
//! - `GET /api/v1/payments/{id}` - fetch a payment
//! - `POST /api/v1/payments/{id}/reconcile` - verify the backing deploy
//!   on chain and confirm the payment

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::error::{AppError, is_unique_violation};
use crate::middleware::auth::AuthContext;
use crate::models::payment::{CreatePaymentRequest, Payment, ReconcileOutcome, ReconcileRequest};
use crate::services::{verification, webhooks};
use crate::state::AppState;

/// Create a payment record.
///
/// # Request Body
///
/// ```json
/// {
///   "recipient": "0202f5a9...",
///   "amount": 100,
///   "deploy_hash": null
/// }
/// ```
///
/// The payment starts `pending`; reconciliation confirms it once the
/// payer's deploy is on chain. A `payment.created` webhook is dispatched
/// detached - its outcome never affects this request.
pub async fn create_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth.require_scope("write:payments")?;

    if request.amount <= 0 {
        return Err(AppError::InvalidRequest(
            "Amount must be positive".to_string(),
        ));
    }
    // Fail early on garbage recipients rather than at reconcile time
    verification::account_hash_from_public_key(&request.recipient)?;

    let payment = sqlx::query_as::<_, Payment>(
        r#"
        INSERT INTO payments (merchant_id, deploy_hash, recipient, amount)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(auth.merchant_uuid)
    .bind(&request.deploy_hash)
    .bind(&request.recipient)
    .bind(request.amount)
    .fetch_one(&state.pool)
    .await
    .map_err(|err| {
        // A client-supplied hash can collide with an existing payment
        if is_unique_violation(&err) {
            AppError::InvalidRequest(
                "Deploy hash is already attached to another payment".to_string(),
            )
        } else {
            err.into()
        }
    })?;

    webhooks::dispatch_detached(
        state.pool.clone(),
        state.http.clone(),
        auth.merchant_uuid,
        auth.merchant_id.clone(),
        "payment.created".to_string(),
        serde_json::json!({
            "payment_id": payment.id,
            "amount": payment.amount,
            "recipient": payment.recipient,
        }),
    );

    Ok((StatusCode::CREATED, Json(payment)))
}

/// Get a payment by ID.
///
/// Returns 404 if the payment does not belong to the authenticated
/// merchant.
pub async fn get_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    auth.require_scope("read:payments")?;

    let payment = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE id = $1 AND merchant_id = $2",
    )
    .bind(payment_id)
    .bind(auth.merchant_uuid)
    .fetch_optional(&state.pool)
    .await?
    .ok_or(AppError::PaymentNotFound)?;

    Ok(Json(payment))
}

/// Reconcile a payment against the chain.
///
/// # Request Body
///
/// ```json
/// { "deploy_hash": "deadbeef..." }
/// ```
///
/// The hash may be omitted when the payment already stores one. The
/// response tells the caller whether the payment was confirmed, had
/// already been processed (idempotent repeat), or was rejected with a
/// structured verification result.
pub async fn reconcile_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<ReconcileRequest>,
) -> Result<Json<ReconcileOutcome>, AppError> {
    auth.require_scope("write:payments")?;

    let outcome = verification::reconcile_payment(
        &state.pool,
        &state.rpc,
        &state.http,
        auth.merchant_uuid,
        &auth.merchant_id,
        payment_id,
        request.deploy_hash,
    )
    .await?;

    Ok(Json(outcome))
}
