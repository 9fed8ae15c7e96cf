//! Payment records and on-chain verification results.
//!
//! A payment starts `pending` with an expected recipient and amount. Once
//! the payer's deploy lands on chain, the reconciliation flow verifies it
//! against the ledger and transitions the payment to `confirmed`, which in
//! turn triggers a `payment.completed` webhook.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Represents a payment record from the database.
///
/// # Database Table
///
/// Maps to the `payments` table. `deploy_hash` is unique, so a single
/// on-chain deploy can back at most one payment record - this is what
/// makes reconciliation idempotent at the storage layer.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub merchant_id: Uuid,

    /// On-chain deploy hash, once the payer has submitted it
    pub deploy_hash: Option<String>,

    /// Expected recipient, as a hex-encoded account public key
    pub recipient: String,

    /// Expected amount in whole tokens (converted to motes at 1:1e9
    /// when compared against the chain)
    pub amount: i64,

    pub status: PaymentStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request body for creating a payment record.
///
/// # JSON Example
///
/// ```json
/// {
///   "recipient": "0202f5a9...",
///   "amount": 100,
///   "deploy_hash": null
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    pub recipient: String,
    pub amount: i64,
    #[serde(default)]
    pub deploy_hash: Option<String>,
}

/// Request body for reconciling a payment against the chain.
///
/// The deploy hash may already be stored on the payment; supplying it
/// here attaches it first.
#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    #[serde(default)]
    pub deploy_hash: Option<String>,
}

/// Result of cross-checking an on-chain deploy against an expected
/// recipient and amount. Ephemeral - returned to the caller, never
/// persisted.
///
/// A failed check is a value (`valid = false` plus a reason), not an
/// error: the caller decides whether to retry (deploy not yet finalized)
/// or reject permanently (explicit mismatch).
#[derive(Debug, Clone, Serialize)]
pub struct TransactionVerification {
    pub valid: bool,
    pub deploy_hash: String,
    /// Actual transferred amount in motes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Human-readable reason when `valid` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransactionVerification {
    /// An invalid result carrying a diagnostic reason.
    pub fn invalid(deploy_hash: &str, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            deploy_hash: deploy_hash.to_string(),
            amount: None,
            recipient: None,
            sender: None,
            timestamp: None,
            error: Some(reason.into()),
        }
    }
}

/// Outcome of a reconciliation attempt, returned to the API caller.
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ReconcileOutcome {
    /// Payment was verified on chain and transitioned to confirmed
    Confirmed { payment_id: Uuid },
    /// A confirmed payment already exists for this deploy hash
    AlreadyProcessed { deploy_hash: String },
    /// Verification failed; the payment record was left untouched
    /// (or marked failed for explicit mismatches)
    Rejected { verification: TransactionVerification },
}
