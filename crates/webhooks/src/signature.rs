//! Payload signing
//!
//! `X-Webhook-Signature: hex(HMAC_SHA256(secret, body))` over the exact
//! bytes sent on the wire.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Hex HMAC-SHA256 of `body` under `secret`
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();

    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Constant-time signature verification for receivers
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let expected = sign(secret, body);
    if expected.len() != signature_hex.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in expected.bytes().zip(signature_hex.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
        let signature = sign("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let body = br#"{"event_type":"call_ended","conversation_id":"c1"}"#;
        let signature = sign("shh", body);
        assert!(verify("shh", body, &signature));
        assert!(!verify("shh", body, "deadbeef"));
        assert!(!verify("wrong", body, &signature));
    }

    #[test]
    fn test_different_bodies_differ() {
        assert_ne!(sign("s", b"a"), sign("s", b"b"));
    }
}
