//! API key validation and issuance.
//!
//! Resolves a bearer credential to a merchant identity plus permission
//! set. The full check sequence:
//!
//! 1. Reject empty keys and unrecognized prefixes (no DB touched)
//! 2. Hash the key and look it up where `is_active = true`
//! 3. Enforce expiry
//! 4. Resolve the owning merchant; it must be `active`
//! 5. Cross-check key class against merchant network (live↔mainnet,
//!    test↔testnet) - a leaked test credential must never authenticate
//!    against production funds, and vice versa
//! 6. Enforce the required permission scope
//! 7. Record `last_used_at` best-effort, off the request path
//!
//! Steps 3–6 are pure over already-fetched rows (`evaluate_key`), so the
//! decision table is testable without a database.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::api_key::{ApiKey, IssueKeyRequest, IssueKeyResponse, KeyPrefix};
use crate::models::merchant::{Merchant, MerchantStatus};
use crate::services::credentials;

/// Identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct ValidatedMerchant {
    /// ID of the API key that authenticated (rate-limit + audit key)
    pub api_key_id: Uuid,

    /// Internal merchant UUID (row ownership checks)
    pub merchant_uuid: Uuid,

    /// Human-readable merchant key (webhook payloads, limiter key)
    pub merchant_id: String,

    pub key_prefix: KeyPrefix,

    /// Scopes granted to the authenticating key
    pub permissions: Vec<String>,
}

impl ValidatedMerchant {
    /// Enforce that the authenticating key carries `scope`.
    pub fn require_scope(&self, scope: &str) -> Result<(), AppError> {
        if self.permissions.iter().any(|p| p == scope) {
            Ok(())
        } else {
            Err(AppError::InsufficientPermissions)
        }
    }
}

/// Pure decision core: expiry, merchant status, network match, scope.
///
/// Returns the error a request with this key/merchant pair must receive,
/// or `Ok(())` when the pair is acceptable.
pub fn evaluate_key(
    key: &ApiKey,
    merchant: &Merchant,
    required_scope: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if let Some(expires_at) = key.expires_at {
        if expires_at <= now {
            return Err(AppError::ExpiredApiKey);
        }
    }

    if merchant.status != MerchantStatus::Active {
        return Err(AppError::InactiveMerchant);
    }

    // 403, not 401: the key exists and hashed correctly, it is just
    // pinned to the other network
    if let Some(allowed) = key.key_prefix.allowed_network() {
        if merchant.network != allowed {
            return Err(AppError::key_forbidden());
        }
    }

    if let Some(scope) = required_scope {
        if !key.permissions.iter().any(|p| p == scope) {
            return Err(AppError::InsufficientPermissions);
        }
    }

    Ok(())
}

/// Validate a raw API key and resolve its merchant.
///
/// `required_scope` is enforced when given; the auth middleware passes
/// `None` and lets each handler enforce its own scope on the returned
/// [`ValidatedMerchant`].
pub async fn validate_api_key(
    pool: &DbPool,
    raw_key: &str,
    required_scope: Option<&str>,
) -> Result<ValidatedMerchant, AppError> {
    if raw_key.is_empty() {
        return Err(AppError::invalid_key());
    }

    // Unknown prefix: reject before any lookup
    if KeyPrefix::from_raw_key(raw_key).is_none() {
        return Err(AppError::invalid_key());
    }

    let key_hash = credentials::hash_key(raw_key);

    let key = sqlx::query_as::<_, ApiKey>(
        "SELECT * FROM api_keys WHERE key_hash = $1 AND is_active = true",
    )
    .bind(&key_hash)
    .fetch_optional(pool)
    .await?
    .ok_or_else(AppError::invalid_key)?;

    let merchant = sqlx::query_as::<_, Merchant>("SELECT * FROM merchants WHERE id = $1")
        .bind(key.merchant_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::InactiveMerchant)?;

    evaluate_key(&key, &merchant, required_scope, Utc::now())?;

    touch_last_used(pool.clone(), key.id);

    Ok(ValidatedMerchant {
        api_key_id: key.id,
        merchant_uuid: merchant.id,
        merchant_id: merchant.merchant_id,
        key_prefix: key.key_prefix,
        permissions: key.permissions,
    })
}

/// Record `last_used_at` without blocking the request.
///
/// Spawned as a detached task; a failed update is logged and otherwise
/// ignored - usage bookkeeping must never fail authentication.
fn touch_last_used(pool: DbPool, key_id: Uuid) {
    tokio::spawn(async move {
        let result = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&pool)
            .await;
        if let Err(e) = result {
            tracing::warn!(%key_id, "Failed to record last_used_at: {e}");
        }
    });
}

/// Issue a new API key for a merchant.
///
/// The plaintext key appears only in the returned response; the database
/// stores its hash. Issuing a `live` key for a testnet merchant (or
/// `test` for mainnet) is rejected up front, since such a key could
/// never validate.
pub async fn issue_api_key(
    pool: &DbPool,
    merchant_uuid: Uuid,
    request: IssueKeyRequest,
) -> Result<IssueKeyResponse, AppError> {
    let merchant = sqlx::query_as::<_, Merchant>("SELECT * FROM merchants WHERE id = $1")
        .bind(merchant_uuid)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::InactiveMerchant)?;

    if let Some(allowed) = request.key_prefix.allowed_network() {
        if merchant.network != allowed {
            return Err(AppError::InvalidRequest(format!(
                "a {:?} key cannot be issued for a {:?} merchant",
                request.key_prefix, merchant.network
            )));
        }
    }

    if request.permissions.is_empty() {
        return Err(AppError::InvalidRequest(
            "at least one permission scope is required".to_string(),
        ));
    }

    let (plaintext, key_hash) = credentials::generate_api_key(request.key_prefix);

    let key = sqlx::query_as::<_, ApiKey>(
        r#"
        INSERT INTO api_keys (merchant_id, key_prefix, key_hash, permissions, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(merchant_uuid)
    .bind(request.key_prefix)
    .bind(&key_hash)
    .bind(&request.permissions)
    .bind(request.expires_at)
    .fetch_one(pool)
    .await?;

    Ok(IssueKeyResponse {
        id: key.id,
        key: plaintext,
        key_prefix: key.key_prefix,
        permissions: key.permissions,
        expires_at: key.expires_at,
        created_at: key.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::merchant::Network;
    use chrono::Duration;

    fn merchant(status: MerchantStatus, network: Network) -> Merchant {
        Merchant {
            id: Uuid::new_v4(),
            merchant_id: "acme-store".to_string(),
            status,
            network,
            created_at: Utc::now(),
        }
    }

    fn key(prefix: KeyPrefix, merchant: &Merchant, permissions: &[&str]) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            merchant_id: merchant.id,
            key_prefix: prefix,
            key_hash: credentials::hash_key("cp_test_000000000000000000000000"),
            permissions: permissions.iter().map(|s| s.to_string()).collect(),
            is_active: true,
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn active_pairing_with_scope_passes() {
        let m = merchant(MerchantStatus::Active, Network::Mainnet);
        let k = key(KeyPrefix::Live, &m, &["write:payments"]);
        assert!(evaluate_key(&k, &m, Some("write:payments"), Utc::now()).is_ok());
    }

    #[test]
    fn expired_key_is_rejected() {
        let m = merchant(MerchantStatus::Active, Network::Mainnet);
        let mut k = key(KeyPrefix::Live, &m, &["write:payments"]);
        k.expires_at = Some(Utc::now() - Duration::hours(1));
        assert!(matches!(
            evaluate_key(&k, &m, None, Utc::now()),
            Err(AppError::ExpiredApiKey)
        ));
    }

    #[test]
    fn suspended_merchant_is_rejected() {
        let m = merchant(MerchantStatus::Suspended, Network::Mainnet);
        let k = key(KeyPrefix::Live, &m, &["write:payments"]);
        assert!(matches!(
            evaluate_key(&k, &m, None, Utc::now()),
            Err(AppError::InactiveMerchant)
        ));
    }

    #[test]
    fn test_key_against_mainnet_merchant_is_forbidden() {
        let m = merchant(MerchantStatus::Active, Network::Mainnet);
        let k = key(KeyPrefix::Test, &m, &["write:payments"]);
        assert!(matches!(
            evaluate_key(&k, &m, None, Utc::now()),
            Err(AppError::InvalidApiKey { forbidden: true })
        ));
    }

    #[test]
    fn live_key_against_testnet_merchant_is_forbidden() {
        let m = merchant(MerchantStatus::Active, Network::Testnet);
        let k = key(KeyPrefix::Live, &m, &["write:payments"]);
        assert!(matches!(
            evaluate_key(&k, &m, None, Utc::now()),
            Err(AppError::InvalidApiKey { forbidden: true })
        ));
    }

    #[test]
    fn secret_key_is_not_network_pinned() {
        let m = merchant(MerchantStatus::Active, Network::Testnet);
        let k = key(KeyPrefix::Secret, &m, &["admin:keys"]);
        assert!(evaluate_key(&k, &m, Some("admin:keys"), Utc::now()).is_ok());
    }

    #[test]
    fn missing_scope_is_rejected() {
        let m = merchant(MerchantStatus::Active, Network::Mainnet);
        let k = key(KeyPrefix::Live, &m, &["read:subscriptions"]);
        assert!(matches!(
            evaluate_key(&k, &m, Some("write:payments"), Utc::now()),
            Err(AppError::InsufficientPermissions)
        ));
    }

    #[test]
    fn unknown_prefixes_are_recognized_as_invalid() {
        assert!(KeyPrefix::from_raw_key("sk_live_abc").is_none());
        assert!(KeyPrefix::from_raw_key("").is_none());
        assert!(KeyPrefix::from_raw_key("cp_live_abc").is_some());
        assert!(KeyPrefix::from_raw_key("cp_secret_abc").is_some());
    }
}
