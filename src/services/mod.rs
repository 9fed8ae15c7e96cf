//! Business logic services.
//!
//! Services contain core logic separated from HTTP handlers: credential
//! hashing and validation, rate limiting, webhook signing and dispatch,
//! and on-chain transaction verification.

pub mod api_keys;
pub mod credentials;
pub mod rate_limit;
pub mod signature;
pub mod verification;
pub mod webhooks;
