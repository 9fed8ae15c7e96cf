//! Application configuration management.
//!
//! This module handles loading configuration from environment variables.
//! It uses the `envy` crate to automatically deserialize environment
//! variables into a type-safe struct.

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// # Environment Variables
///
/// - `DATABASE_URL` (required): PostgreSQL connection string
/// - `SERVER_PORT` (optional): HTTP server port, defaults to 3000
/// - `RPC_URL` (required): primary chain JSON-RPC endpoint
/// - `RPC_FALLBACK_URL` (optional): secondary RPC endpoint tried when
///   the primary call fails at the transport level
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,

    #[serde(default = "default_port")]
    pub server_port: u16,

    pub rpc_url: String,

    #[serde(default)]
    pub rpc_fallback_url: Option<String>,
}

/// Default port if SERVER_PORT environment variable is not set.
fn default_port() -> u16 {
    3000
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Attempts to load a `.env` file first (optional), then reads
    /// environment variables into a Config struct.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or cannot be
    /// parsed into the expected types.
    pub fn from_env() -> Result<Self, envy::Error> {
        // Try to load .env file if it exists (does nothing if not found)
        dotenvy::dotenv().ok();

        // Field names are automatically converted: rpc_url -> RPC_URL
        envy::from_env::<Config>()
    }
}
