//! Credential hashing and secret generation.
//!
//! API keys are stored as SHA-256 digests. Hashing is deterministic and
//! unsalted so that validation is a single equality lookup on the hash
//! column - the keys themselves are high-entropy random strings, not
//! user-chosen passwords, so a salt buys nothing here.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::models::api_key::KeyPrefix;

/// Length of the random portion of an API key.
const KEY_SECRET_LEN: usize = 24;

const LOWER_ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Hash a raw key or secret with SHA-256, returning lowercase hex.
///
/// Deterministic: the same input always yields the same digest, which is
/// what makes lookup-by-hash work as an indexed equality query.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a fresh API key for the given class.
///
/// Returns `(plaintext, hash)`. The plaintext is shown to the caller
/// exactly once; only the hash is persisted.
///
/// # Format
///
/// `cp_{live|test|secret}_{24 lowercase alphanumeric chars}`
pub fn generate_api_key(prefix: KeyPrefix) -> (String, String) {
    let mut rng = rand::rng();
    let secret: String = (0..KEY_SECRET_LEN)
        .map(|_| {
            let idx = rng.random_range(0..LOWER_ALPHANUMERIC.len());
            LOWER_ALPHANUMERIC[idx] as char
        })
        .collect();

    let plaintext = format!("{}{}", prefix.as_key_prefix(), secret);
    let hash = hash_key(&plaintext);
    (plaintext, hash)
}

/// Generate a cryptographically secure webhook secret.
///
/// 64 hex characters (32 random bytes), used as the HMAC key for
/// signing deliveries to one endpoint.
pub fn generate_webhook_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        let a = hash_key("cp_test_abc123");
        let b = hash_key("cp_test_abc123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn distinct_inputs_hash_differently() {
        assert_ne!(hash_key("cp_test_abc123"), hash_key("cp_test_abc124"));
    }

    #[test]
    fn generated_keys_carry_prefix_and_length() {
        let (plaintext, hash) = generate_api_key(KeyPrefix::Live);
        assert!(plaintext.starts_with("cp_live_"));
        assert_eq!(plaintext.len(), "cp_live_".len() + 24);
        assert!(
            plaintext["cp_live_".len()..]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
        assert_eq!(hash, hash_key(&plaintext));
    }

    #[test]
    fn webhook_secrets_are_unique_hex() {
        let a = generate_webhook_secret();
        let b = generate_webhook_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(hex::decode(&a).is_ok());
    }
}
