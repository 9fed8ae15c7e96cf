//! CasPay Gateway - Main Application Entry Point
//!
//! This is the payment-gateway core for accepting chain-native payments:
//! API-key-authenticated endpoints for payments and webhook management,
//! HMAC-signed webhook dispatch with retry scheduling, and on-chain
//! transaction verification against a JSON-RPC node.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx (async queries)
//! - **Authentication**: `X-CasPay-Key` header, SHA-256 hashed keys,
//!   per-merchant fixed-window rate limiting
//! - **Chain access**: JSON-RPC with primary/fallback endpoints
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool and run migrations
//! 3. Build the chain RPC client and outbound HTTP client
//! 4. Spawn background workers (rate-limit sweeper, webhook retries)
//! 5. Build the HTTP router and start serving

mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod rpc;
mod services;
mod state;

use std::sync::Arc;

use axum::{
    Router, middleware as axum_middleware,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::services::rate_limit::RateLimiter;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG, defaults to "info"
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load configuration
    let config = config::Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool and run migrations
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("Database ready");

    let rpc = Arc::new(rpc::ChainRpcClient::new(
        config.rpc_url.clone(),
        config.rpc_fallback_url.clone(),
    )?);

    // Outbound client for webhook deliveries; per-request timeout is set
    // at call sites
    let http = reqwest::Client::new();

    let rate_limiter = RateLimiter::in_memory();
    rate_limiter.spawn_sweeper();

    services::webhooks::spawn_retry_worker(pool.clone(), http.clone());

    let app_state = AppState {
        pool,
        rate_limiter,
        rpc,
        http,
    };

    // Authenticated routes (API endpoints)
    let authenticated_routes = Router::new()
        // Key issuance (secret keys only)
        .route("/api/v1/api-keys", post(handlers::api_keys::issue_key))
        // Payment routes
        .route("/api/v1/payments", post(handlers::payments::create_payment))
        .route(
            "/api/v1/payments/{id}",
            get(handlers::payments::get_payment),
        )
        .route(
            "/api/v1/payments/{id}/reconcile",
            post(handlers::payments::reconcile_payment),
        )
        // Webhook routes
        .route("/api/v1/webhooks", post(handlers::webhooks::create_webhook))
        .route("/api/v1/webhooks", get(handlers::webhooks::list_webhooks))
        .route(
            "/api/v1/webhooks/{id}",
            delete(handlers::webhooks::delete_webhook),
        )
        .route(
            "/api/v1/webhooks/{id}/rotate-secret",
            post(handlers::webhooks::rotate_webhook_secret),
        )
        .route(
            "/api/v1/webhooks/{id}/deliveries",
            get(handlers::webhooks::list_webhook_deliveries),
        )
        // Apply authentication + rate limiting to all routes in this group
        .route_layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            middleware::auth::auth_middleware,
        ));

    // Combine authenticated routes with public routes
    let app = Router::new()
        // Public routes (no authentication required)
        .route("/health", get(handlers::health::health_check))
        .merge(authenticated_routes)
        // Request tracing for observability
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // Bind to network address and start server
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
