//! Shared application state.

use std::sync::Arc;

use crate::db::DbPool;
use crate::rpc::ChainRpcClient;
use crate::services::rate_limit::RateLimiter;

/// State shared with every handler via axum's `State` extraction.
///
/// Everything here is cheap to clone: the pool and HTTP client are
/// handle types, the rest sit behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub rate_limiter: RateLimiter,
    pub rpc: Arc<ChainRpcClient>,
    /// Outbound client for webhook deliveries
    pub http: reqwest::Client,
}
