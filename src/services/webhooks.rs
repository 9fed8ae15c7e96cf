//! Webhook dispatch: endpoint management, signed delivery, and retries.
//!
//! # Delivery Model
//!
//! Dispatch is at-least-once and fire-and-forget from the caller's
//! perspective: recording a payment must never fail because a merchant's
//! endpoint is down. Deliveries to multiple endpoints run concurrently
//! with no ordering guarantee; one endpoint failing never affects the
//! others. Every attempt is recorded in `webhook_deliveries`.
//!
//! Failed deliveries are retried by a background worker on a fixed
//! backoff schedule (1 min, 5 min, 25 min, 2 h, 10 h) up to
//! [`MAX_RETRIES`] attempts, after which the delivery is permanently
//! failed. Receivers are expected to dedupe by delivery id.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::AppError;
use crate::models::webhook::{
    WebhookDelivery, WebhookEndpoint, WebhookEndpointRequest, WebhookEndpointResponse,
    WebhookPayload,
};
use crate::services::{credentials, signature};

/// Per-endpoint POST timeout.
pub const DELIVERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Maximum delivery attempts before a delivery is permanently failed.
pub const MAX_RETRIES: i32 = 5;

/// Backoff schedule in seconds, indexed by (capped) attempt number.
///
/// Kept as a lookup table rather than a formula so the schedule stays
/// exactly: 1 min, 5 min, 25 min, 2 h, 10 h.
const RETRY_DELAYS_SECS: [i64; 5] = [60, 300, 1500, 7200, 36_000];

/// Compute the next retry delay after `attempt_count` attempts.
///
/// Returns `None` at or beyond [`MAX_RETRIES`] - the delivery is then
/// permanently failed and no further attempts are scheduled.
pub fn next_retry_after(attempt_count: i32) -> Option<Duration> {
    if attempt_count >= MAX_RETRIES || attempt_count < 1 {
        return None;
    }
    let idx = ((attempt_count - 1) as usize).min(RETRY_DELAYS_SECS.len() - 1);
    Some(Duration::seconds(RETRY_DELAYS_SECS[idx]))
}

/// Does a subscription list match an event type?
///
/// Supported patterns: exact (`payment.completed`), prefix wildcard
/// (`payment.*`), and match-all (`*`).
pub fn event_matches(subscribed: &[String], event_type: &str) -> bool {
    subscribed.iter().any(|pattern| {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'));
        }
        pattern == event_type
    })
}

/// Outcome of one HTTP delivery attempt.
#[derive(Debug)]
pub struct DeliveryAttempt {
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    /// True only for a 2xx response
    pub success: bool,
}

/// POST one signed payload to one endpoint.
///
/// Network failures and timeouts become a recorded failure (`success =
/// false`, body carrying the error), never an `Err` - delivery problems
/// are data, not control flow.
pub async fn deliver_once(
    http: &reqwest::Client,
    endpoint_url: &str,
    endpoint_secret: &str,
    event_type: &str,
    body: &str,
) -> DeliveryAttempt {
    let sig = signature::sign(body.as_bytes(), endpoint_secret);

    let response = http
        .post(endpoint_url)
        .header("Content-Type", "application/json")
        .header("X-CasPay-Signature", sig)
        .header("X-CasPay-Event", event_type)
        .header("X-CasPay-Timestamp", Utc::now().to_rfc3339())
        .header("User-Agent", "CasPay-Webhook/1.0")
        .timeout(DELIVERY_TIMEOUT)
        .body(body.to_string())
        .send()
        .await;

    match response {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.ok();
            DeliveryAttempt {
                response_status: Some(status.as_u16() as i32),
                response_body: body,
                success: status.is_success(),
            }
        }
        Err(e) => DeliveryAttempt {
            response_status: None,
            response_body: Some(format!("Request failed: {e}")),
            success: false,
        },
    }
}

/// Dispatch an event to every subscribed endpoint of a merchant.
///
/// Loads active endpoints, filters by subscription, signs and POSTs to
/// each concurrently, and records one `webhook_deliveries` row per
/// attempt. Returns after all deliveries have settled. Having no
/// subscribed endpoint is a silent no-op, not an error.
pub async fn trigger_event(
    pool: &DbPool,
    http: &reqwest::Client,
    merchant_uuid: Uuid,
    merchant_id: &str,
    event_type: &str,
    data: serde_json::Value,
) -> Result<(), AppError> {
    let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
        "SELECT * FROM webhook_endpoints WHERE merchant_id = $1 AND is_active = true",
    )
    .bind(merchant_uuid)
    .fetch_all(pool)
    .await?;

    let subscribed: Vec<WebhookEndpoint> = endpoints
        .into_iter()
        .filter(|e| event_matches(&e.events, event_type))
        .collect();

    if subscribed.is_empty() {
        return Ok(());
    }

    let payload = WebhookPayload::new(merchant_id.to_string(), event_type.to_string(), data);
    // Serialized once; the signature is computed over these exact bytes
    let body = serde_json::to_string(&payload)
        .map_err(|e| AppError::InvalidRequest(format!("Failed to serialize payload: {e}")))?;
    let payload_value = serde_json::to_value(&payload)
        .map_err(|e| AppError::InvalidRequest(format!("Failed to serialize payload: {e}")))?;

    let deliveries = subscribed.iter().map(|endpoint| {
        let body = body.as_str();
        let payload_value = payload_value.clone();
        async move {
            let attempt = deliver_once(http, &endpoint.url, &endpoint.secret, event_type, body).await;

            if !attempt.success {
                tracing::warn!(
                    endpoint = %endpoint.url,
                    status = ?attempt.response_status,
                    "Webhook delivery failed, scheduling retry"
                );
            }

            if let Err(e) =
                record_attempt(pool, endpoint.id, event_type, payload_value, &attempt).await
            {
                tracing::error!(endpoint = %endpoint.url, "Failed to record delivery: {e}");
            }
        }
    });

    // All deliveries settle before we return; individual failures were
    // already swallowed and recorded above
    join_all(deliveries).await;

    Ok(())
}

/// Fire-and-forget dispatch, detached from the caller's request path.
///
/// The spawned task owns clones of the pool and client; its errors are
/// logged, never surfaced to the triggering operation.
pub fn dispatch_detached(
    pool: DbPool,
    http: reqwest::Client,
    merchant_uuid: Uuid,
    merchant_id: String,
    event_type: String,
    data: serde_json::Value,
) {
    tokio::spawn(async move {
        if let Err(e) =
            trigger_event(&pool, &http, merchant_uuid, &merchant_id, &event_type, data).await
        {
            tracing::error!(%merchant_id, %event_type, "Webhook dispatch failed: {e}");
        }
    });
}

/// Insert the per-attempt delivery row for an initial dispatch.
///
/// Successful attempts get `delivered_at`; failed ones get the first
/// retry slot.
async fn record_attempt(
    pool: &DbPool,
    endpoint_id: Uuid,
    event_type: &str,
    payload: serde_json::Value,
    attempt: &DeliveryAttempt,
) -> Result<(), AppError> {
    let (delivered_at, next_retry_at) = if attempt.success {
        (Some(Utc::now()), None)
    } else {
        (None, next_retry_after(1).map(|d| Utc::now() + d))
    };

    sqlx::query(
        r#"
        INSERT INTO webhook_deliveries (
            webhook_endpoint_id,
            event_type,
            payload,
            response_status,
            response_body,
            attempt_count,
            delivered_at,
            next_retry_at
        )
        VALUES ($1, $2, $3, $4, $5, 1, $6, $7)
        "#,
    )
    .bind(endpoint_id)
    .bind(event_type)
    .bind(payload)
    .bind(attempt.response_status)
    .bind(&attempt.response_body)
    .bind(delivered_at)
    .bind(next_retry_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// A delivery that is due for retry, joined with its endpoint.
#[derive(Debug, sqlx::FromRow)]
struct DueRetry {
    id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    attempt_count: i32,
    url: String,
    secret: String,
}

/// Re-attempt every due delivery.
///
/// Each retry updates the existing row: increments `attempt_count`,
/// records the new response, and either marks success, schedules the
/// next slot, or permanently fails the delivery (`next_retry_at = NULL`).
pub async fn process_due_retries(pool: &DbPool, http: &reqwest::Client) -> Result<u64, AppError> {
    let due = sqlx::query_as::<_, DueRetry>(
        r#"
        SELECT d.id, d.event_type, d.payload, d.attempt_count, e.url, e.secret
        FROM webhook_deliveries d
        JOIN webhook_endpoints e ON e.id = d.webhook_endpoint_id
        WHERE d.delivered_at IS NULL
          AND d.next_retry_at IS NOT NULL
          AND d.next_retry_at <= NOW()
          AND e.is_active = true
        ORDER BY d.next_retry_at
        LIMIT 50
        "#,
    )
    .fetch_all(pool)
    .await?;

    // One bad row must not starve the rest of the batch, so per-row
    // failures are logged and skipped, same as initial dispatch.
    let mut retried = 0u64;
    for delivery in due {
        let body = match serde_json::to_string(&delivery.payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(
                    delivery_id = %delivery.id,
                    error = %e,
                    "Skipping retry with unserializable stored payload"
                );
                continue;
            }
        };

        let attempt =
            deliver_once(http, &delivery.url, &delivery.secret, &delivery.event_type, &body).await;

        let attempt_count = delivery.attempt_count + 1;
        let (delivered_at, next_retry_at) = retry_disposition(attempt.success, attempt_count);
        if !attempt.success && next_retry_at.is_none() {
            tracing::warn!(
                delivery_id = %delivery.id,
                attempt_count,
                "Delivery permanently failed after exhausting retries"
            );
        }

        let recorded = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET attempt_count = $1,
                response_status = $2,
                response_body = $3,
                delivered_at = $4,
                next_retry_at = $5
            WHERE id = $6
            "#,
        )
        .bind(attempt_count)
        .bind(attempt.response_status)
        .bind(&attempt.response_body)
        .bind(delivered_at)
        .bind(next_retry_at)
        .bind(delivery.id)
        .execute(pool)
        .await;

        if let Err(e) = recorded {
            tracing::error!(
                delivery_id = %delivery.id,
                error = %e,
                "Failed to record retry outcome"
            );
            continue;
        }

        retried += 1;
    }

    Ok(retried)
}

/// Columns to write back after a retry: `(delivered_at, next_retry_at)`.
///
/// Success stamps the delivery and clears the schedule; failure books
/// the next slot, or leaves both `NULL` once the schedule is exhausted.
fn retry_disposition(
    success: bool,
    attempt_count: i32,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    if success {
        (Some(Utc::now()), None)
    } else {
        (None, next_retry_after(attempt_count).map(|d| Utc::now() + d))
    }
}

/// Spawn the background worker that drives the retry schedule.
///
/// Polls for due deliveries once a minute for the lifetime of the
/// process.
pub fn spawn_retry_worker(pool: DbPool, http: reqwest::Client) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            match process_due_retries(&pool, &http).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(retried = n, "Processed due webhook retries"),
                Err(e) => tracing::error!("Retry worker pass failed: {e}"),
            }
        }
    });
}

// ---------------------------------------------------------------------
// Endpoint management
// ---------------------------------------------------------------------

/// Create a new webhook endpoint with a generated secret.
///
/// The secret is returned exactly once, in this response.
pub async fn create_endpoint(
    pool: &DbPool,
    merchant_uuid: Uuid,
    request: WebhookEndpointRequest,
) -> Result<WebhookEndpointResponse, AppError> {
    validate_webhook_url(&request.url)?;

    if request.events.is_empty() {
        return Err(AppError::InvalidRequest(
            "at least one event pattern is required".to_string(),
        ));
    }

    let secret = credentials::generate_webhook_secret();

    let endpoint = sqlx::query_as::<_, WebhookEndpoint>(
        r#"
        INSERT INTO webhook_endpoints (merchant_id, url, secret, events)
        VALUES ($1, $2, $3, $4)
        RETURNING *
        "#,
    )
    .bind(merchant_uuid)
    .bind(&request.url)
    .bind(&secret)
    .bind(&request.events)
    .fetch_one(pool)
    .await?;

    Ok(WebhookEndpointResponse::from(endpoint).with_secret(secret))
}

/// List all active endpoints for a merchant (secrets excluded).
pub async fn list_endpoints(
    pool: &DbPool,
    merchant_uuid: Uuid,
) -> Result<Vec<WebhookEndpointResponse>, AppError> {
    let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
        "SELECT * FROM webhook_endpoints
         WHERE merchant_id = $1 AND is_active = true
         ORDER BY created_at DESC",
    )
    .bind(merchant_uuid)
    .fetch_all(pool)
    .await?;

    Ok(endpoints.into_iter().map(|e| e.into()).collect())
}

/// Soft-delete an endpoint, preserving its delivery history.
pub async fn delete_endpoint(
    pool: &DbPool,
    merchant_uuid: Uuid,
    endpoint_id: Uuid,
) -> Result<(), AppError> {
    let result = sqlx::query(
        "UPDATE webhook_endpoints SET is_active = false WHERE id = $1 AND merchant_id = $2",
    )
    .bind(endpoint_id)
    .bind(merchant_uuid)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::WebhookNotFound);
    }

    Ok(())
}

/// Replace an endpoint's signing secret.
///
/// Deliveries signed with the old secret stop verifying immediately;
/// the new secret is returned once.
pub async fn rotate_secret(
    pool: &DbPool,
    merchant_uuid: Uuid,
    endpoint_id: Uuid,
) -> Result<WebhookEndpointResponse, AppError> {
    let secret = credentials::generate_webhook_secret();

    let endpoint = sqlx::query_as::<_, WebhookEndpoint>(
        r#"
        UPDATE webhook_endpoints
        SET secret = $1
        WHERE id = $2 AND merchant_id = $3 AND is_active = true
        RETURNING *
        "#,
    )
    .bind(&secret)
    .bind(endpoint_id)
    .bind(merchant_uuid)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::WebhookNotFound)?;

    Ok(WebhookEndpointResponse::from(endpoint).with_secret(secret))
}

/// List recent delivery attempts for one endpoint.
///
/// Lets merchants audit what was sent, when, and how the endpoint
/// answered - including pending retries and permanently failed
/// deliveries.
pub async fn list_deliveries(
    pool: &DbPool,
    merchant_uuid: Uuid,
    endpoint_id: Uuid,
) -> Result<Vec<WebhookDelivery>, AppError> {
    let owns: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM webhook_endpoints WHERE id = $1 AND merchant_id = $2)",
    )
    .bind(endpoint_id)
    .bind(merchant_uuid)
    .fetch_one(pool)
    .await?;

    if !owns {
        return Err(AppError::WebhookNotFound);
    }

    let deliveries = sqlx::query_as::<_, WebhookDelivery>(
        "SELECT * FROM webhook_deliveries
         WHERE webhook_endpoint_id = $1
         ORDER BY created_at DESC
         LIMIT 100",
    )
    .bind(endpoint_id)
    .fetch_all(pool)
    .await?;

    Ok(deliveries)
}

/// Validate a webhook URL: HTTPS required, HTTP allowed for localhost.
fn validate_webhook_url(url: &str) -> Result<(), AppError> {
    if url.len() > 2048 {
        return Err(AppError::InvalidWebhookUrl(
            "URL exceeds 2048 characters".to_string(),
        ));
    }

    let parsed = url::Url::parse(url)
        .map_err(|_| AppError::InvalidWebhookUrl("Invalid URL format".to_string()))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            if matches!(
                parsed.host_str(),
                Some("localhost") | Some("127.0.0.1") | Some("0.0.0.0")
            ) {
                Ok(())
            } else {
                Err(AppError::InvalidWebhookUrl(
                    "HTTP is only allowed for localhost. Use HTTPS for production.".to_string(),
                ))
            }
        }
        _ => Err(AppError::InvalidWebhookUrl(
            "URL must use HTTP or HTTPS".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn subs(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_and_wildcard_event_matching() {
        assert!(event_matches(&subs(&["payment.completed"]), "payment.completed"));
        assert!(!event_matches(&subs(&["payment.completed"]), "payment.failed"));

        assert!(event_matches(&subs(&["payment.*"]), "payment.completed"));
        assert!(event_matches(&subs(&["payment.*"]), "payment.failed"));
        assert!(!event_matches(&subs(&["payment.*"]), "subscription.created"));
        // Prefix must be followed by a dot segment, not merely share text
        assert!(!event_matches(&subs(&["payment.*"]), "payments.created"));
        assert!(!event_matches(&subs(&["payment.*"]), "payment"));

        assert!(event_matches(&subs(&["*"]), "anything.at.all"));
        assert!(!event_matches(&subs(&[]), "payment.completed"));
    }

    #[test]
    fn backoff_schedule_is_exact() {
        assert_eq!(next_retry_after(1), Some(Duration::seconds(60)));
        assert_eq!(next_retry_after(2), Some(Duration::seconds(300)));
        assert_eq!(next_retry_after(3), Some(Duration::seconds(1500)));
        assert_eq!(next_retry_after(4), Some(Duration::seconds(7200)));
        // At or beyond the retry ceiling: permanently failed
        assert_eq!(next_retry_after(5), None);
        assert_eq!(next_retry_after(6), None);
        assert_eq!(next_retry_after(0), None);
    }

    #[test]
    fn retry_disposition_stamps_or_reschedules() {
        let (delivered_at, next_retry_at) = retry_disposition(true, 3);
        assert!(delivered_at.is_some());
        assert!(next_retry_at.is_none());

        let (delivered_at, next_retry_at) = retry_disposition(false, 2);
        assert!(delivered_at.is_none());
        let next = next_retry_at.unwrap();
        assert!(next > Utc::now() + Duration::seconds(299));
        assert!(next <= Utc::now() + Duration::seconds(300));

        // Schedule exhausted: both NULL, delivery is permanently failed
        assert_eq!(retry_disposition(false, 5), (None, None));
    }

    #[test]
    fn url_validation_rules() {
        assert!(validate_webhook_url("https://example.com/hook").is_ok());
        assert!(validate_webhook_url("http://localhost:8080/hook").is_ok());
        assert!(validate_webhook_url("http://127.0.0.1/hook").is_ok());
        assert!(validate_webhook_url("http://example.com/hook").is_err());
        assert!(validate_webhook_url("ftp://example.com/hook").is_err());
        assert!(validate_webhook_url("not a url").is_err());
        assert!(validate_webhook_url(&format!("https://e.com/{}", "a".repeat(2048))).is_err());
    }

    #[tokio::test]
    async fn delivery_sends_contract_headers_and_signed_body() {
        let server = MockServer::start().await;
        let body = r#"{"event":"payment.completed","data":{},"timestamp":"2025-01-01T00:00:00Z","merchant_id":"acme"}"#;
        let expected_sig = signature::sign(body.as_bytes(), "whsec_test");

        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("Content-Type", "application/json"))
            .and(header("X-CasPay-Event", "payment.completed"))
            .and(header("X-CasPay-Signature", expected_sig.as_str()))
            .and(header("User-Agent", "CasPay-Webhook/1.0"))
            .and(header_exists("X-CasPay-Timestamp"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let attempt = deliver_once(
            &http,
            &format!("{}/hook", server.uri()),
            "whsec_test",
            "payment.completed",
            body,
        )
        .await;

        assert!(attempt.success);
        assert_eq!(attempt.response_status, Some(200));
        assert_eq!(attempt.response_body.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn failures_are_recorded_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let attempt = deliver_once(&http, &server.uri(), "s", "payment.completed", "{}").await;

        assert!(!attempt.success);
        assert_eq!(attempt.response_status, Some(500));
    }

    #[tokio::test]
    async fn connection_refused_becomes_failed_attempt() {
        let http = reqwest::Client::new();
        // Nothing listens on this port
        let attempt =
            deliver_once(&http, "http://127.0.0.1:1/hook", "s", "payment.completed", "{}").await;

        assert!(!attempt.success);
        assert_eq!(attempt.response_status, None);
        assert!(attempt.response_body.unwrap().contains("Request failed"));
    }

    #[tokio::test]
    async fn one_failing_endpoint_does_not_affect_the_other() {
        let ok_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&ok_server)
            .await;

        let bad_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&bad_server)
            .await;

        let http = reqwest::Client::new();
        let ok_uri = ok_server.uri();
        let bad_uri = bad_server.uri();
        let (good, bad) = tokio::join!(
            deliver_once(&http, &ok_uri, "s1", "payment.completed", "{}"),
            deliver_once(&http, &bad_uri, "s2", "payment.completed", "{}"),
        );

        assert!(good.success);
        assert!(!bad.success);
    }
}
