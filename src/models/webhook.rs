//! Webhook models for endpoint registration and event delivery.
//!
//! # Webhook Flow
//!
//! 1. Merchant registers an endpoint via `POST /api/v1/webhooks`,
//!    subscribing to event patterns (`payment.completed`, `payment.*`, `*`)
//! 2. The gateway generates a secret for HMAC signature verification
//! 3. When events occur, the dispatcher POSTs a signed payload to every
//!    subscribed endpoint and records the attempt
//! 4. Failed deliveries are retried on an exponential backoff schedule
//!
//! # Security
//!
//! - Secrets are only shown once, at registration or rotation
//! - Payloads are signed with HMAC-SHA256 over the exact bytes sent
//! - HTTPS is required for non-localhost endpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Webhook endpoint registered by a merchant.
///
/// # Database Table
///
/// Maps to the `webhook_endpoints` table.
///
/// # Secret Storage
///
/// The `secret` is stored in plaintext (required for HMAC generation)
/// but never returned in list operations.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub merchant_id: Uuid,
    pub url: String,
    pub secret: String,
    /// Subscribed event patterns: exact, `prefix.*`, or `*`
    pub events: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Request to register a new webhook endpoint.
///
/// # Example
///
/// ```json
/// {
///   "url": "https://example.com/webhook",
///   "events": ["payment.*"]
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct WebhookEndpointRequest {
    pub url: String,
    /// Defaults to subscribing to every event
    #[serde(default = "default_events")]
    pub events: Vec<String>,
}

fn default_events() -> Vec<String> {
    vec!["*".to_string()]
}

/// Response when registering or listing a webhook endpoint.
///
/// # Security Note
///
/// The `secret` field is ONLY included when creating the endpoint or
/// rotating its secret. It is never returned in list operations.
#[derive(Debug, Serialize)]
pub struct WebhookEndpointResponse {
    pub id: Uuid,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WebhookEndpoint> for WebhookEndpointResponse {
    fn from(endpoint: WebhookEndpoint) -> Self {
        Self {
            id: endpoint.id,
            url: endpoint.url,
            secret: None, // Never include secret by default
            events: endpoint.events,
            is_active: endpoint.is_active,
            created_at: endpoint.created_at,
        }
    }
}

impl WebhookEndpointResponse {
    /// Attach the secret (only for creation and rotation responses).
    pub fn with_secret(mut self, secret: String) -> Self {
        self.secret = Some(secret);
        self
    }
}

/// Webhook delivery record - one row per attempt.
///
/// # Database Table
///
/// Maps to the `webhook_deliveries` table.
///
/// # Lifecycle
///
/// A row is created on every dispatch attempt. `delivered_at` is set only
/// when the endpoint answered with a 2xx status. Failed attempts carry a
/// `next_retry_at`; once the retry ceiling is reached the row is left with
/// `next_retry_at = NULL` and the delivery is permanently failed.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_endpoint_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub attempt_count: i32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Webhook payload sent to the registered endpoint.
///
/// This is the JSON body of the HTTP POST. The HMAC signature in
/// `X-CasPay-Signature` is computed over the exact serialized bytes of
/// this structure, so receivers must verify against the raw body they
/// read off the wire, before any re-parsing.
///
/// # Example
///
/// ```json
/// {
///   "event": "payment.completed",
///   "data": { "payment_id": "...", "amount": 100 },
///   "timestamp": "2025-01-15T10:30:00Z",
///   "merchant_id": "acme-store"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Event type (e.g., "payment.completed")
    pub event: String,

    /// Event-specific data; opaque JSON so new event types can ship
    /// without a payload schema change
    pub data: serde_json::Value,

    /// When the event was emitted
    pub timestamp: DateTime<Utc>,

    /// Human-readable merchant key the event belongs to
    pub merchant_id: String,
}

impl WebhookPayload {
    pub fn new(merchant_id: String, event: String, data: serde_json::Value) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now(),
            merchant_id,
        }
    }
}
