//! On-chain transaction verification and payment reconciliation.
//!
//! Cross-checks a deploy reported by a payer against what the payment
//! record expects: did it execute successfully, did it pay the right
//! recipient, and did it pay at least the expected amount (overpayment
//! is accepted, underpayment is not).
//!
//! Reconciliation is idempotent under at-least-once retry: before
//! accepting a verified deploy, the flow checks whether a confirmed
//! payment already exists for that hash, and the confirming UPDATE is
//! guarded so exactly one call transitions the row.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use chrono::Utc;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{AppError, is_unique_violation};
use crate::models::payment::{
    Payment, PaymentStatus, ReconcileOutcome, TransactionVerification,
};
use crate::rpc::{ChainRpcClient, ExecutionResult, GetDeployResult};
use crate::services::webhooks;

type Blake2b256 = Blake2b<U32>;

/// Motes per whole token (fixed 1:1e9 scale).
pub const MOTES_PER_TOKEN: u128 = 1_000_000_000;

/// Derive the canonical account hash for a hex-encoded public key.
///
/// The first byte of the key tags the algorithm (`01` = ed25519, `02` =
/// secp256k1); the hash is blake2b-256 over the lowercase algorithm
/// name, a zero separator, and the raw key bytes. Returned as lowercase
/// hex.
pub fn account_hash_from_public_key(public_key_hex: &str) -> Result<String, AppError> {
    let bytes = hex::decode(public_key_hex.trim())
        .map_err(|_| AppError::InvalidRequest("public key is not valid hex".to_string()))?;

    let (algorithm, raw) = match bytes.split_first() {
        Some((0x01, raw)) if raw.len() == 32 => ("ed25519", raw),
        Some((0x02, raw)) if raw.len() == 33 => ("secp256k1", raw),
        _ => {
            return Err(AppError::InvalidRequest(
                "public key has an unrecognized algorithm tag or length".to_string(),
            ));
        }
    };

    let mut hasher = Blake2b256::new();
    hasher.update(algorithm.as_bytes());
    hasher.update([0u8]);
    hasher.update(raw);
    Ok(hex::encode(hasher.finalize()))
}

/// Strip the `account-hash-` prefix, if present, and lowercase.
fn normalize_account_hash(value: &str) -> String {
    value
        .strip_prefix("account-hash-")
        .unwrap_or(value)
        .to_ascii_lowercase()
}

/// Pure verification core over an already-fetched deploy.
///
/// Every failure is a structured `valid = false` result with a reason;
/// the caller decides whether the condition is retryable (deploy not yet
/// executed) or permanent (explicit mismatch).
pub fn check_deploy(
    result: &GetDeployResult,
    deploy_hash: &str,
    expected_recipient_pubkey: &str,
    expected_tokens: i64,
) -> Result<TransactionVerification, AppError> {
    let Some(entry) = result.execution_results.first() else {
        // Deploy seen but not yet executed in a block
        return Ok(TransactionVerification::invalid(deploy_hash, "not found"));
    };

    let transfers = match &entry.result {
        ExecutionResult::Failure { error_message } => {
            return Ok(TransactionVerification::invalid(
                deploy_hash,
                format!("failed on chain: {error_message}"),
            ));
        }
        ExecutionResult::Success { transfers } => transfers,
    };

    let Some(transfer) = transfers.first() else {
        return Ok(TransactionVerification::invalid(deploy_hash, "no transfer"));
    };

    let expected_hash = account_hash_from_public_key(expected_recipient_pubkey)?;
    let actual_recipient = transfer.to.as_deref().unwrap_or("");
    if normalize_account_hash(actual_recipient) != expected_hash {
        // Both values go into the reason for diagnostics
        return Ok(TransactionVerification::invalid(
            deploy_hash,
            format!("recipient mismatch: expected {expected_hash}, got {actual_recipient}"),
        ));
    }

    let actual_motes: u128 = transfer.amount.parse().map_err(|_| {
        AppError::Rpc(format!(
            "node returned a non-numeric transfer amount: {}",
            transfer.amount
        ))
    })?;
    let expected_motes = (expected_tokens.max(0) as u128) * MOTES_PER_TOKEN;

    // Overpayment accepted, underpayment rejected
    if actual_motes < expected_motes {
        return Ok(TransactionVerification::invalid(
            deploy_hash,
            format!("amount mismatch: expected at least {expected_motes} motes, got {actual_motes}"),
        ));
    }

    Ok(TransactionVerification {
        valid: true,
        deploy_hash: deploy_hash.to_string(),
        amount: Some(transfer.amount.clone()),
        recipient: Some(normalize_account_hash(actual_recipient)),
        sender: Some(transfer.from.clone()),
        timestamp: Some(result.deploy.header.timestamp),
        error: None,
    })
}

/// Verify a deploy against an expected recipient and amount.
///
/// Fetches the deploy via RPC (primary, then fallback) and runs
/// [`check_deploy`]. A deploy the node does not know yet yields
/// `valid = false, "not found"` - callers typically retry later.
pub async fn verify_deploy(
    rpc: &ChainRpcClient,
    deploy_hash: &str,
    expected_recipient_pubkey: &str,
    expected_tokens: i64,
) -> Result<TransactionVerification, AppError> {
    match rpc.get_deploy(deploy_hash).await? {
        None => Ok(TransactionVerification::invalid(deploy_hash, "not found")),
        Some(result) => check_deploy(
            &result,
            deploy_hash,
            expected_recipient_pubkey,
            expected_tokens,
        ),
    }
}

/// Has a confirmed payment already consumed this deploy hash?
pub async fn is_already_processed(pool: &DbPool, deploy_hash: &str) -> Result<bool, AppError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM payments
            WHERE deploy_hash = $1 AND status = 'confirmed'
        )",
    )
    .bind(deploy_hash)
    .fetch_one(pool)
    .await?;

    Ok(exists)
}

/// Decide whether reconciliation can stop before touching the chain.
///
/// `Some` when the payment itself is already confirmed, or when the
/// deploy hash has been consumed by another confirmed payment. A failed
/// payment is not terminal: the payer may submit a fresh deploy.
fn settled_short_circuit(
    status: PaymentStatus,
    hash_already_confirmed: bool,
    deploy_hash: &str,
) -> Option<ReconcileOutcome> {
    if status == PaymentStatus::Confirmed || hash_already_confirmed {
        return Some(ReconcileOutcome::AlreadyProcessed {
            deploy_hash: deploy_hash.to_string(),
        });
    }
    None
}

/// Reconcile one payment against the chain.
///
/// # Process
///
/// 1. Load the payment (scoped to the calling merchant)
/// 2. Resolve the deploy hash (request override or stored value)
/// 3. Short-circuit if a confirmed payment already holds this hash
/// 4. Verify the deploy on chain
/// 5. On success, transition the row to `confirmed` with a guarded
///    UPDATE, then dispatch `payment.completed` detached
///
/// An invalid verification leaves the payment untouched and returns the
/// structured result - the deploy might simply not be finalized yet, or
/// the payer may submit a different deploy later.
pub async fn reconcile_payment(
    pool: &DbPool,
    rpc: &ChainRpcClient,
    http: &reqwest::Client,
    merchant_uuid: Uuid,
    merchant_id: &str,
    payment_id: Uuid,
    deploy_hash_override: Option<String>,
) -> Result<ReconcileOutcome, AppError> {
    let payment = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE id = $1 AND merchant_id = $2",
    )
    .bind(payment_id)
    .bind(merchant_uuid)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::PaymentNotFound)?;

    let deploy_hash = deploy_hash_override
        .or_else(|| payment.deploy_hash.clone())
        .ok_or_else(|| {
            AppError::InvalidRequest("payment has no deploy hash to verify".to_string())
        })?;

    let hash_already_confirmed = payment.status != PaymentStatus::Confirmed
        && is_already_processed(pool, &deploy_hash).await?;
    if let Some(outcome) = settled_short_circuit(payment.status, hash_already_confirmed, &deploy_hash)
    {
        return Ok(outcome);
    }

    let verification =
        verify_deploy(rpc, &deploy_hash, &payment.recipient, payment.amount).await?;

    if !verification.valid {
        tracing::info!(
            %payment_id,
            %deploy_hash,
            reason = verification.error.as_deref().unwrap_or(""),
            "Payment verification rejected"
        );
        return Ok(ReconcileOutcome::Rejected { verification });
    }

    // Guarded transition: of two concurrent reconciliations, exactly one
    // flips the row
    let result = sqlx::query(
        r#"
        UPDATE payments
        SET deploy_hash = $1,
            status = 'confirmed',
            confirmed_at = NOW(),
            updated_at = NOW()
        WHERE id = $2 AND status <> 'confirmed'
        "#,
    )
    .bind(&deploy_hash)
    .bind(payment_id)
    .execute(pool)
    .await;

    let updated = match result {
        Ok(done) => done.rows_affected(),
        // The hash is unique across payments; losing that race means
        // another payment row holds this deploy
        Err(err) if is_unique_violation(&err) => {
            tracing::warn!(
                %payment_id,
                %deploy_hash,
                "Deploy hash already attached to another payment"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed { deploy_hash });
        }
        Err(err) => return Err(err.into()),
    };

    if updated == 0 {
        return Ok(ReconcileOutcome::AlreadyProcessed { deploy_hash });
    }

    tracing::info!(%payment_id, %deploy_hash, "Payment confirmed");

    webhooks::dispatch_detached(
        pool.clone(),
        http.clone(),
        merchant_uuid,
        merchant_id.to_string(),
        "payment.completed".to_string(),
        serde_json::json!({
            "payment_id": payment_id,
            "deploy_hash": deploy_hash,
            "amount": payment.amount,
            "recipient": payment.recipient,
            "sender": verification.sender,
            "confirmed_at": Utc::now(),
        }),
    );

    Ok(ReconcileOutcome::Confirmed { payment_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Deploy, DeployHeader, ExecutionResultEntry, Transfer};

    // 01-tagged (ed25519) key: 32 raw bytes
    const ED25519_KEY: &str =
        "01aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    // 02-tagged (secp256k1) key: 33 raw bytes
    const SECP_KEY: &str =
        "02bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn deploy_result(execution: Option<ExecutionResult>) -> GetDeployResult {
        GetDeployResult {
            deploy: Deploy {
                hash: "deadbeef".to_string(),
                header: DeployHeader {
                    account: ED25519_KEY.to_string(),
                    timestamp: Utc::now(),
                },
            },
            execution_results: execution
                .into_iter()
                .map(|result| ExecutionResultEntry { result })
                .collect(),
        }
    }

    fn transfer_to(recipient_pubkey: &str, motes: u128) -> Transfer {
        Transfer {
            amount: motes.to_string(),
            from: "account-hash-0000".to_string(),
            to: Some(format!(
                "account-hash-{}",
                account_hash_from_public_key(recipient_pubkey).unwrap()
            )),
        }
    }

    #[test]
    fn account_hash_is_deterministic_and_algorithm_sensitive() {
        let a = account_hash_from_public_key(ED25519_KEY).unwrap();
        let b = account_hash_from_public_key(ED25519_KEY).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, account_hash_from_public_key(SECP_KEY).unwrap());
    }

    #[test]
    fn malformed_public_keys_are_rejected() {
        assert!(account_hash_from_public_key("zz").is_err());
        assert!(account_hash_from_public_key("01abcd").is_err()); // wrong length
        assert!(account_hash_from_public_key("0faa").is_err()); // unknown tag
    }

    #[test]
    fn pending_deploy_reports_not_found() {
        let result = deploy_result(None);
        let v = check_deploy(&result, "deadbeef", ED25519_KEY, 100).unwrap();
        assert!(!v.valid);
        assert_eq!(v.error.as_deref(), Some("not found"));
    }

    #[test]
    fn on_chain_failure_is_reported() {
        let result = deploy_result(Some(ExecutionResult::Failure {
            error_message: "Out of gas".to_string(),
        }));
        let v = check_deploy(&result, "deadbeef", ED25519_KEY, 100).unwrap();
        assert!(!v.valid);
        assert!(v.error.unwrap().starts_with("failed on chain"));
    }

    #[test]
    fn missing_transfer_is_reported() {
        let result = deploy_result(Some(ExecutionResult::Success { transfers: vec![] }));
        let v = check_deploy(&result, "deadbeef", ED25519_KEY, 100).unwrap();
        assert!(!v.valid);
        assert_eq!(v.error.as_deref(), Some("no transfer"));
    }

    #[test]
    fn recipient_mismatch_carries_both_values() {
        let result = deploy_result(Some(ExecutionResult::Success {
            transfers: vec![transfer_to(SECP_KEY, 100 * MOTES_PER_TOKEN)],
        }));
        let v = check_deploy(&result, "deadbeef", ED25519_KEY, 100).unwrap();
        assert!(!v.valid);
        let reason = v.error.unwrap();
        assert!(reason.contains("recipient mismatch"));
        assert!(reason.contains(&account_hash_from_public_key(ED25519_KEY).unwrap()));
    }

    #[test]
    fn recipient_comparison_is_case_insensitive() {
        let mut transfer = transfer_to(ED25519_KEY, 100 * MOTES_PER_TOKEN);
        transfer.to = transfer.to.map(|t| t.to_ascii_uppercase().replace("ACCOUNT-HASH-", "account-hash-"));
        let result = deploy_result(Some(ExecutionResult::Success {
            transfers: vec![transfer],
        }));
        let v = check_deploy(&result, "deadbeef", ED25519_KEY, 100).unwrap();
        assert!(v.valid, "{:?}", v.error);
    }

    #[test]
    fn overpayment_is_accepted_underpayment_is_not() {
        let over = deploy_result(Some(ExecutionResult::Success {
            transfers: vec![transfer_to(ED25519_KEY, 105 * MOTES_PER_TOKEN)],
        }));
        let v = check_deploy(&over, "deadbeef", ED25519_KEY, 100).unwrap();
        assert!(v.valid);
        assert_eq!(v.amount.as_deref(), Some("105000000000"));

        let under = deploy_result(Some(ExecutionResult::Success {
            transfers: vec![transfer_to(ED25519_KEY, 95 * MOTES_PER_TOKEN)],
        }));
        let v = check_deploy(&under, "deadbeef", ED25519_KEY, 100).unwrap();
        assert!(!v.valid);
        assert!(v.error.unwrap().contains("amount mismatch"));
    }

    #[test]
    fn reconciling_a_confirmed_payment_short_circuits() {
        let outcome = settled_short_circuit(PaymentStatus::Confirmed, false, "cafe01");
        assert!(matches!(
            outcome,
            Some(ReconcileOutcome::AlreadyProcessed { ref deploy_hash }) if deploy_hash == "cafe01"
        ));
    }

    #[test]
    fn a_hash_consumed_by_another_payment_short_circuits() {
        let outcome = settled_short_circuit(PaymentStatus::Pending, true, "cafe01");
        assert!(matches!(
            outcome,
            Some(ReconcileOutcome::AlreadyProcessed { .. })
        ));
    }

    #[test]
    fn unsettled_payments_proceed_to_verification() {
        assert!(settled_short_circuit(PaymentStatus::Pending, false, "cafe01").is_none());
        // A failed payment may be retried with a fresh deploy
        assert!(settled_short_circuit(PaymentStatus::Failed, false, "cafe01").is_none());
    }

    #[test]
    fn exact_amount_is_accepted() {
        let result = deploy_result(Some(ExecutionResult::Success {
            transfers: vec![transfer_to(ED25519_KEY, 100 * MOTES_PER_TOKEN)],
        }));
        let v = check_deploy(&result, "deadbeef", ED25519_KEY, 100).unwrap();
        assert!(v.valid);
        assert!(v.sender.is_some());
        assert!(v.timestamp.is_some());
    }
}
