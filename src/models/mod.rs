//! Data models representing database entities.
//!
//! This module contains all data structures that map to database tables,
//! plus the request/response types exchanged with API clients.

/// API key authentication model
pub mod api_key;
/// Merchant identity model
pub mod merchant;
/// Payment records and on-chain verification results
pub mod payment;
/// Webhook endpoint, delivery, and payload models
pub mod webhook;
