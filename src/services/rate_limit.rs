//! Fixed-window rate limiting.
//!
//! Requests are counted per `{merchant}:{operation}` key inside a fixed
//! window. The counting store is behind the [`RateLimitStore`] trait so
//! the in-process map used here and a shared store (for multi-instance
//! deployments) are interchangeable - the in-memory implementation only
//! limits correctly within a single process, which is a documented
//! scaling limitation rather than a correctness bug for single-instance
//! operation.
//!
//! # Window Semantics
//!
//! One entry per (key, window). A hit against an expired entry replaces
//! it with a fresh one rather than incrementing, so a new window always
//! starts with `count = 1`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Per-operation limiter configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    /// 60 requests per 60-second window.
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::seconds(60),
        }
    }
}

impl RateLimitConfig {
    /// Looser limit for read-heavy operations (e.g., subscription checks).
    pub fn read_heavy() -> Self {
        Self {
            max_requests: 100,
            window: Duration::seconds(60),
        }
    }
}

/// One counter window for a single key.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Outcome of a rate-limit check, carrying everything the HTTP layer
/// needs to emit `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until the window resets; set only on rejection
    pub retry_after_secs: Option<u64>,
}

/// Counting-store contract.
///
/// `hit` atomically records one request against `key` and decides
/// whether it fits the window. `sweep` drops expired entries to bound
/// memory; a store backed by a TTL-capable service can make it a no-op.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn hit(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision;
    async fn sweep(&self);
}

/// Process-local store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    entries: DashMap<String, RateLimitEntry>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn decide(entry: &RateLimitEntry, config: &RateLimitConfig, allowed: bool) -> RateLimitDecision {
        let remaining = config.max_requests.saturating_sub(entry.count);
        let retry_after_secs = if allowed {
            None
        } else {
            // ceil((reset_at - now) / 1s), floored at 1 so callers never
            // see "retry after 0"
            let millis = (entry.reset_at - Utc::now()).num_milliseconds().max(0);
            Some((((millis as u64) + 999) / 1000).max(1))
        };
        RateLimitDecision {
            allowed,
            limit: config.max_requests,
            remaining,
            reset_at: entry.reset_at,
            retry_after_secs,
        }
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn hit(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        let now = Utc::now();

        // The dashmap entry guard serializes concurrent hits on one key;
        // no await happens while it is held.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(RateLimitEntry {
                count: 0,
                reset_at: now + config.window,
            });

        if now >= entry.reset_at {
            // Window elapsed: replace, don't increment
            *entry = RateLimitEntry {
                count: 1,
                reset_at: now + config.window,
            };
            return Self::decide(&entry, config, true);
        }

        if entry.count >= config.max_requests {
            return Self::decide(&entry, config, false);
        }

        entry.count += 1;
        Self::decide(&entry, config, true)
    }

    async fn sweep(&self) {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.reset_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired rate-limit entries");
        }
    }
}

/// Limiter facade: a store plus the default configuration, shared via
/// `Arc` across the router and the background sweeper.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    default_config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, default_config: RateLimitConfig) -> Self {
        Self {
            store,
            default_config,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryRateLimitStore::new()),
            RateLimitConfig::default(),
        )
    }

    /// Record one request with the default configuration.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        self.store.hit(key, &self.default_config).await
    }

    /// Record one request with a per-operation override.
    pub async fn check_with(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.store.hit(key, config).await
    }

    /// Spawn the periodic sweeper that drops expired windows.
    ///
    /// Runs every 5 minutes for the lifetime of the process.
    pub fn spawn_sweeper(&self) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            // First tick fires immediately; skip it
            interval.tick().await;
            loop {
                interval.tick().await;
                store.sweep().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_window(max_requests: u32, millis: i64) -> RateLimitConfig {
        RateLimitConfig {
            max_requests,
            window: Duration::milliseconds(millis),
        }
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let store = InMemoryRateLimitStore::new();
        let config = small_window(3, 1000);

        for i in 1..=3 {
            let decision = store.hit("m1:pay", &config).await;
            assert!(decision.allowed, "call {i} should pass");
            assert_eq!(decision.remaining, 3 - i);
        }

        let rejected = store.hit("m1:pay", &config).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after_secs.unwrap() > 0);
    }

    #[test]
    fn retry_after_is_floored_at_one_second() {
        // Window about to close: the raw ceiling would round to zero
        let entry = RateLimitEntry {
            count: 60,
            reset_at: Utc::now(),
        };
        let decision =
            InMemoryRateLimitStore::decide(&entry, &RateLimitConfig::default(), false);
        assert_eq!(decision.retry_after_secs, Some(1));
    }

    #[tokio::test]
    async fn window_expiry_resets_counter() {
        let store = InMemoryRateLimitStore::new();
        let config = small_window(2, 30);

        assert!(store.hit("m1:pay", &config).await.allowed);
        assert!(store.hit("m1:pay", &config).await.allowed);
        assert!(!store.hit("m1:pay", &config).await.allowed);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Fresh window starts at count = 1
        let decision = store.hit("m1:pay", &config).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let store = InMemoryRateLimitStore::new();
        let config = small_window(1, 1000);

        assert!(store.hit("m1:pay", &config).await.allowed);
        assert!(!store.hit("m1:pay", &config).await.allowed);
        // A different merchant/operation key is unaffected
        assert!(store.hit("m2:pay", &config).await.allowed);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired_entries() {
        let store = InMemoryRateLimitStore::new();
        store.hit("short", &small_window(5, 10)).await;
        store.hit("long", &small_window(5, 60_000)).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.sweep().await;

        assert!(!store.entries.contains_key("short"));
        assert!(store.entries.contains_key("long"));
    }
}
