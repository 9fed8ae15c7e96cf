//! HMAC signing and verification for webhook payloads.
//!
//! Outbound deliveries are signed with HMAC-SHA256 over the exact
//! serialized body that goes on the wire (signing after serialization,
//! so there is no canonicalization to disagree about). Verification uses
//! a constant-time comparison: the party checking a signature may be
//! talking to an adversary, and a byte-by-byte early-exit compare leaks
//! how much of the signature matched.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Sign a payload, returning the lowercase-hex HMAC-SHA256 digest.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature against a payload and secret.
///
/// Returns false for malformed hex as well as for a mismatch. The
/// comparison over decoded bytes is constant-time.
pub fn verify(payload: &[u8], signature_hex: &str, secret: &str) -> bool {
    let Ok(provided) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    expected.ct_eq(provided.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let payload = br#"{"event":"payment.completed","data":{"amount":100}}"#;
        let signature = sign(payload, "whsec_abc123");
        assert!(verify(payload, &signature, "whsec_abc123"));
    }

    #[test]
    fn flipped_byte_fails_verification() {
        let payload = b"{\"event\":\"payment.completed\"}".to_vec();
        let signature = sign(&payload, "whsec_abc123");

        let mut tampered = payload.clone();
        tampered[10] ^= 0x01;
        assert!(!verify(&tampered, &signature, "whsec_abc123"));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let payload = b"{}";
        let signature = sign(payload, "secret-a");
        assert!(!verify(payload, &signature, "secret-b"));
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!(!verify(b"{}", "not-hex!", "secret"));
        assert!(!verify(b"{}", "", "secret"));
    }

    #[test]
    fn signature_is_hex_of_expected_length() {
        let signature = sign(b"{}", "secret");
        assert_eq!(signature.len(), 64);
        assert!(hex::decode(&signature).is_ok());
    }
}
