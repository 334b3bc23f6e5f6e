//! Signature operations for inbound and outbound webhook payloads.
//!
//! - HMAC-SHA256 over `{timestamp}{body}` with hex output
//! - Parsing and verification of `t=<unix-seconds>,v1=<hex-hmac>` headers
//!   with replay protection

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::clock::SharedClock;
use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature on inbound and outbound webhook requests.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Default accepted clock skew between signer and verifier.
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Hex length of an HMAC-SHA256 digest.
const SIGNATURE_HEX_LEN: usize = 64;

// ---------------------------------------------------------------------------
// HMAC-SHA256 payload signing
// ---------------------------------------------------------------------------

/// Compute the HMAC-SHA256 signature for a webhook payload.
///
/// The MAC covers the timestamp bytes immediately followed by the body
/// bytes, with no separator. Returns a hex-encoded string.
pub fn compute_hmac_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<String, WebhookError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Internal(format!("HMAC key rejected: {e}")))?;

    mac.update(timestamp.as_bytes());
    mac.update(body);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a complete signature header value for `body` signed at `timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, WebhookError> {
    let ts = timestamp.to_string();
    let signature = compute_hmac_signature(secret, &ts, body)?;
    Ok(format!("t={ts},v1={signature}"))
}

/// Constant-time byte comparison to prevent timing attacks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

// ---------------------------------------------------------------------------
// Header parsing and verification
// ---------------------------------------------------------------------------

/// A parsed `t=...,v1=...` signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub timestamp: i64,
    /// Every `v1` entry; more than one is sent during secret rotation.
    pub signatures: Vec<String>,
}

impl SignatureHeader {
    /// Parse a header value. Returns `None` when malformed.
    ///
    /// Unknown keys are ignored so senders can add schemes later.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let mut timestamp = None;
        let mut signatures = Vec::new();

        for part in value.split(',') {
            let (key, val) = part.trim().split_once('=')?;
            match key.trim() {
                "t" => {
                    if timestamp.is_some() {
                        return None;
                    }
                    timestamp = Some(val.trim().parse::<i64>().ok()?);
                }
                "v1" => {
                    let sig = val.trim();
                    if sig.len() != SIGNATURE_HEX_LEN
                        || !sig.chars().all(|c| c.is_ascii_hexdigit())
                    {
                        return None;
                    }
                    signatures.push(sig.to_ascii_lowercase());
                }
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

/// Verify a signed payload against a shared secret.
///
/// Returns `false` (never an error) when the header is malformed, no `v1`
/// entry matches, or `|now - t| > tolerance_secs`.
#[must_use]
pub fn verify_signature(
    raw_payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: u64,
    now_unix: i64,
) -> bool {
    let Some(parsed) = SignatureHeader::parse(header) else {
        tracing::debug!(target: "webhook_ingest", "Malformed signature header");
        return false;
    };

    let skew = now_unix.abs_diff(parsed.timestamp);
    if skew > tolerance_secs {
        tracing::debug!(
            target: "webhook_ingest",
            skew_secs = skew,
            tolerance_secs,
            "Signature timestamp outside tolerance window"
        );
        return false;
    }

    let Ok(expected) = compute_hmac_signature(secret, &parsed.timestamp.to_string(), raw_payload)
    else {
        return false;
    };

    // Compare against every candidate so timing does not reveal which matched.
    parsed
        .signatures
        .iter()
        .fold(false, |matched, candidate| {
            constant_time_eq(candidate.as_bytes(), expected.as_bytes()) | matched
        })
}

/// Verifier bound to a secret, a tolerance and a clock.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: u64,
    clock: SharedClock,
}

impl SignatureVerifier {
    #[must_use]
    pub fn new(secret: impl Into<String>, tolerance_secs: u64, clock: SharedClock) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
            clock,
        }
    }

    #[must_use]
    pub fn tolerance_secs(&self) -> u64 {
        self.tolerance_secs
    }

    /// Verify `raw_payload` against the provided header, if any.
    #[must_use]
    pub fn verify(&self, raw_payload: &[u8], header: Option<&str>) -> bool {
        match header {
            Some(value) => verify_signature(
                raw_payload,
                value,
                &self.secret,
                self.tolerance_secs,
                self.clock.now().timestamp(),
            ),
            None => false,
        }
    }

    /// Sign a payload with the verifier's secret at the current clock time.
    pub fn sign(&self, body: &[u8]) -> Result<String, WebhookError> {
        sign_payload(&self.secret, self.clock.now().timestamp(), body)
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_706_400_000;

    #[test]
    fn test_hmac_signature_deterministic() {
        let sig1 = compute_hmac_signature("secret", "1706400000", b"payload").unwrap();
        let sig2 = compute_hmac_signature("secret", "1706400000", b"payload").unwrap();
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_hmac_signature_changes_with_inputs() {
        let base = compute_hmac_signature("secret", "1706400000", b"payload").unwrap();
        assert_ne!(
            base,
            compute_hmac_signature("secret2", "1706400000", b"payload").unwrap()
        );
        assert_ne!(
            base,
            compute_hmac_signature("secret", "1706400001", b"payload").unwrap()
        );
        assert_ne!(
            base,
            compute_hmac_signature("secret", "1706400000", b"payload2").unwrap()
        );
    }

    #[test]
    fn test_hmac_covers_timestamp_then_body_without_separator() {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(b"secret").unwrap();
        mac.update(b"1706400000payload");
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(
            compute_hmac_signature("secret", "1706400000", b"payload").unwrap(),
            expected
        );
        let header = format!("t=1706400000,v1={expected}");
        assert!(verify_signature(b"payload", &header, "secret", 300, 1_706_400_000));
    }

    #[test]
    fn test_hmac_signature_is_hex_encoded() {
        let sig = compute_hmac_signature("secret", "1706400000", b"payload").unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_parse_header() {
        let sig = "a".repeat(64);
        let parsed = SignatureHeader::parse(&format!("t=123, v1={sig}")).unwrap();
        assert_eq!(parsed.timestamp, 123);
        assert_eq!(parsed.signatures, vec![sig]);
    }

    #[test]
    fn test_parse_header_rejects_malformed() {
        let sig = "b".repeat(64);
        assert!(SignatureHeader::parse("").is_none());
        assert!(SignatureHeader::parse("garbage").is_none());
        assert!(SignatureHeader::parse(&format!("v1={sig}")).is_none());
        assert!(SignatureHeader::parse("t=123").is_none());
        assert!(SignatureHeader::parse(&format!("t=abc,v1={sig}")).is_none());
        assert!(SignatureHeader::parse("t=123,v1=nothex").is_none());
        assert!(SignatureHeader::parse(&format!("t=1,t=2,v1={sig}")).is_none());
    }

    #[test]
    fn test_verify_valid_signature() {
        let header = sign_payload(SECRET, NOW, b"{}").unwrap();
        assert!(verify_signature(b"{}", &header, SECRET, 300, NOW));
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let header = sign_payload(SECRET, NOW, b"{\"a\":1}").unwrap();
        assert!(!verify_signature(b"{\"a\":2}", &header, SECRET, 300, NOW));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let header = sign_payload("other", NOW, b"{}").unwrap();
        assert!(!verify_signature(b"{}", &header, SECRET, 300, NOW));
    }

    #[test]
    fn test_verify_enforces_tolerance_both_directions() {
        let header = sign_payload(SECRET, NOW, b"{}").unwrap();
        assert!(verify_signature(b"{}", &header, SECRET, 300, NOW + 300));
        assert!(!verify_signature(b"{}", &header, SECRET, 300, NOW + 301));
        assert!(!verify_signature(b"{}", &header, SECRET, 300, NOW - 301));
    }

    #[test]
    fn test_verify_accepts_any_rotated_signature() {
        let good = compute_hmac_signature(SECRET, &NOW.to_string(), b"{}").unwrap();
        let stale = "0".repeat(64);
        let header = format!("t={NOW},v1={stale},v1={good}");
        assert!(verify_signature(b"{}", &header, SECRET, 300, NOW));
    }

    #[test]
    fn test_verifier_uses_clock() {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(NOW, 0).unwrap()));
        let verifier = SignatureVerifier::new(SECRET, 60, clock.clone());

        let header = verifier.sign(b"body").unwrap();
        assert!(verifier.verify(b"body", Some(&header)));
        assert!(!verifier.verify(b"body", None));

        clock.advance_secs(61);
        assert!(!verifier.verify(b"body", Some(&header)));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"hi"));
        assert!(!constant_time_eq(b"hello", b"world"));
    }
}
