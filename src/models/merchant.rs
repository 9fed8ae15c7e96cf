//! Merchant identity model.
//!
//! Merchants are the businesses accepting payments through the gateway.
//! The core only consumes a narrow slice of the merchant record: identity,
//! account status, and which chain network the merchant operates on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which chain network a merchant (and its keys) operate against.
///
/// A `live`-prefixed API key may only authenticate a `mainnet` merchant,
/// and a `test`-prefixed key only a `testnet` merchant. The cross-check
/// prevents a leaked test credential from being replayed against real funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Testnet,
    Mainnet,
}

/// Merchant account lifecycle status.
///
/// Only `active` merchants can authenticate. The other states exist so a
/// merchant can be onboarded (`pending`), paused (`suspended`), or wound
/// down (`closed`) without deleting rows that payments still reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MerchantStatus {
    Pending,
    Active,
    Suspended,
    Closed,
}

/// Represents a merchant record from the database.
///
/// # Database Table
///
/// Maps to the `merchants` table:
/// - `id`: Internal unique identifier (UUID)
/// - `merchant_id`: Human-readable key used in webhook payloads
/// - `status`: Account lifecycle state
/// - `network`: Which chain network this merchant transacts on
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Merchant {
    /// Internal unique identifier
    pub id: Uuid,

    /// Human-readable merchant key (e.g., "acme-store")
    ///
    /// This is the identifier included in outbound webhook payloads,
    /// so receivers can route events without knowing internal UUIDs.
    pub merchant_id: String,

    /// Account lifecycle status; only `active` merchants authenticate
    pub status: MerchantStatus,

    /// Chain network this merchant operates on
    pub network: Network,

    /// Timestamp when the merchant was created
    pub created_at: DateTime<Utc>,
}
