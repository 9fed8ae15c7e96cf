//! API key model for authentication.
//!
//! API keys authenticate merchants making requests to the gateway. Keys
//! look like `cp_live_<24 chars>`, `cp_test_<24 chars>`, or
//! `cp_secret_<24 chars>`, and are stored in the database as SHA-256
//! hashes - all key classes, including test keys, are hashed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::merchant::Network;

/// The key-class prefix embedded in every raw API key.
///
/// - `live`: public key for mainnet merchants
/// - `test`: public key for testnet merchants
/// - `secret`: administrative key (key issuance, account management)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum KeyPrefix {
    Live,
    Test,
    Secret,
}

impl KeyPrefix {
    /// Extract the key class from a raw key string.
    ///
    /// Returns `None` when the key does not start with one of the three
    /// recognized `cp_*_` prefixes - such keys are rejected before any
    /// database lookup happens.
    pub fn from_raw_key(raw: &str) -> Option<Self> {
        if raw.starts_with("cp_live_") {
            Some(Self::Live)
        } else if raw.starts_with("cp_test_") {
            Some(Self::Test)
        } else if raw.starts_with("cp_secret_") {
            Some(Self::Secret)
        } else {
            None
        }
    }

    /// The full string prefix, including the trailing underscore.
    pub fn as_key_prefix(&self) -> &'static str {
        match self {
            Self::Live => "cp_live_",
            Self::Test => "cp_test_",
            Self::Secret => "cp_secret_",
        }
    }

    /// Which merchant network this key class is allowed to authenticate.
    ///
    /// `secret` keys are administrative and not pinned to a network.
    pub fn allowed_network(&self) -> Option<Network> {
        match self {
            Self::Live => Some(Network::Mainnet),
            Self::Test => Some(Network::Testnet),
            Self::Secret => None,
        }
    }
}

/// Represents an API key record from the database.
///
/// # Database Table
///
/// Maps to the `api_keys` table. When a request comes in with
/// `X-CasPay-Key: cp_live_abc...`, we:
/// 1. Hash the full key string with SHA-256
/// 2. Look up this hash where `is_active = true`
/// 3. Enforce expiry, merchant status, network match, and scope
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    /// Unique identifier for this API key
    pub id: Uuid,

    /// Merchant that owns this key
    pub merchant_id: Uuid,

    /// Key class (live / test / secret)
    pub key_prefix: KeyPrefix,

    /// SHA-256 hash of the full raw key (64 hex characters)
    pub key_hash: String,

    /// Permission scopes granted to this key (e.g., `write:payments`)
    pub permissions: Vec<String>,

    /// Whether this key is currently active
    ///
    /// Inactive keys are rejected during authentication. Flipping this
    /// flag revokes access without deleting the record.
    pub is_active: bool,

    /// Optional expiry; keys past this instant are rejected
    pub expires_at: Option<DateTime<Utc>>,

    /// Last successful validation, updated best-effort off the hot path
    pub last_used_at: Option<DateTime<Utc>>,

    /// Timestamp when this key was created
    pub created_at: DateTime<Utc>,
}

/// Request body for issuing a new API key.
///
/// # JSON Example
///
/// ```json
/// {
///   "key_prefix": "live",
///   "permissions": ["read:payments", "write:payments"],
///   "expires_at": null
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct IssueKeyRequest {
    pub key_prefix: KeyPrefix,
    pub permissions: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Response when issuing a new API key.
///
/// # Security Note
///
/// The plaintext `key` is ONLY included in this response, at creation
/// time. Afterwards the gateway holds just the hash.
#[derive(Debug, Serialize)]
pub struct IssueKeyResponse {
    pub id: Uuid,
    /// Full plaintext key - shown exactly once
    pub key: String,
    pub key_prefix: KeyPrefix,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
