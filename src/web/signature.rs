//! Stripe webhook signature verification.
//!
//! The `Stripe-Signature` header is `t=<unix>,v1=<hex>[,v1=<hex>...]`. Each
//! `v1` is an HMAC-SHA256 over `"<t>.<raw body>"` keyed with the endpoint
//! secret. Any matching `v1` entry is accepted, and `t` must be within the
//! tolerance window.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::{BotError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Parsed `Stripe-Signature` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<Vec<u8>>,
}

impl SignatureHeader {
    pub fn parse(header: &str) -> Option<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in header.split(',') {
            let (key, value) = part.trim().split_once('=')?;
            match key {
                "t" => timestamp = Some(value.parse().ok()?),
                "v1" => signatures.push(hex::decode(value).ok()?),
                // v0 and unknown schemes are ignored
                _ => {}
            }
        }

        if signatures.is_empty() {
            return None;
        }
        Some(Self {
            timestamp: timestamp?,
            signatures,
        })
    }
}

pub struct SignatureVerifier {
    secret: String,
    tolerance: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verify `header` against the exact request body at time `now` (unix seconds)
    pub fn verify(&self, payload: &[u8], header: Option<&str>, now: i64) -> Result<()> {
        let header = header
            .and_then(SignatureHeader::parse)
            .ok_or(BotError::InvalidSignature)?;

        let age = (now - header.timestamp).unsigned_abs();
        if age > self.tolerance.as_secs() {
            debug!("Webhook signature timestamp is {}s away from now", age);
            return Err(BotError::InvalidSignature);
        }

        let expected = compute_signature(&self.secret, header.timestamp, payload);
        let matched = header
            .signatures
            .iter()
            .any(|candidate| bool::from(expected.as_slice().ct_eq(candidate.as_slice())));
        if matched {
            Ok(())
        } else {
            Err(BotError::InvalidSignature)
        }
    }
}

/// HMAC-SHA256 of `"<timestamp>.<payload>"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Build a `Stripe-Signature` header value for a payload
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        hex::encode(compute_signature(secret, timestamp, payload))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_714_564_800;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SECRET, Duration::from_secs(300))
    }

    #[test]
    fn test_valid_signature_is_accepted() {
        let body = br#"{"type":"identity.verification_session.verified"}"#;
        let header = signature_header(SECRET, NOW, body);
        assert!(verifier().verify(body, Some(&header), NOW + 10).is_ok());
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let header = signature_header(SECRET, NOW, b"{\"a\":1}");
        let result = verifier().verify(b"{\"a\":2}", Some(&header), NOW);
        assert!(matches!(result, Err(BotError::InvalidSignature)));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let body = b"{}";
        let header = signature_header("whsec_other", NOW, body);
        assert!(verifier().verify(body, Some(&header), NOW).is_err());
    }

    #[test]
    fn test_missing_or_malformed_header_is_rejected() {
        let body = b"{}";
        assert!(verifier().verify(body, None, NOW).is_err());
        assert!(verifier().verify(body, Some("garbage"), NOW).is_err());
        assert!(verifier().verify(body, Some("t=abc,v1=00"), NOW).is_err());
        assert!(verifier().verify(body, Some(&format!("t={}", NOW)), NOW).is_err());
        assert!(verifier().verify(body, Some(&format!("t={},v1=zz", NOW)), NOW).is_err());
    }

    #[test]
    fn test_timestamp_outside_tolerance_is_rejected() {
        let body = b"{}";
        let header = signature_header(SECRET, NOW, body);
        assert!(verifier().verify(body, Some(&header), NOW + 301).is_err());
        assert!(verifier().verify(body, Some(&header), NOW - 301).is_err());
        assert!(verifier().verify(body, Some(&header), NOW + 300).is_ok());
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let body = b"{}";
        let good = hex::encode(compute_signature(SECRET, NOW, body));
        let header = format!("t={},v1={},v1={},v0=abcd", NOW, "00".repeat(32), good);
        assert!(verifier().verify(body, Some(&header), NOW).is_ok());
    }

    #[test]
    fn test_parse_header() {
        let parsed = SignatureHeader::parse("t=12,v1=0a0b").unwrap();
        assert_eq!(parsed.timestamp, 12);
        assert_eq!(parsed.signatures, vec![vec![0x0a, 0x0b]]);
    }
}
