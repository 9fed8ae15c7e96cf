//! HTTP request handlers (route handlers).
//!
//! Each handler is an async function that:
//! 1. Receives HTTP request data (JSON body, URL params, auth context)
//! 2. Enforces its required permission scope
//! 3. Delegates to a service and returns a JSON response

/// API key issuance endpoints
pub mod api_keys;
/// Service health endpoint
pub mod health;
/// Payment creation and reconciliation endpoints
pub mod payments;
/// Webhook endpoint management
pub mod webhooks;
