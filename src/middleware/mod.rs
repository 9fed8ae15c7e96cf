//! HTTP middleware components.
//!
//! Middleware runs before route handlers. The auth middleware here
//! authenticates the API key, applies the per-merchant rate limit, and
//! injects the merchant identity for handlers to consume.

/// API key authentication + rate limiting middleware
pub mod auth;
