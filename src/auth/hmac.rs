//! HMAC request authentication.
//!
//! Signatures are HMAC-SHA256 over the raw request body bytes, hex encoded,
//! carried in `X-Signature` or `X-Hub-Signature-256` (with or without a
//! `sha256=` prefix). Verification happens before JSON parsing so the bytes
//! that were signed are the bytes that get checked.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const HUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Why a request failed HMAC verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacDenied {
    SecretUnconfigured,
    MissingSignature,
    MalformedSignature,
    SignatureMismatch,
}

impl HmacDenied {
    pub fn reason(&self) -> &'static str {
        match self {
            HmacDenied::SecretUnconfigured => "secret_unconfigured",
            HmacDenied::MissingSignature => "missing_signature",
            HmacDenied::MalformedSignature => "malformed_signature",
            HmacDenied::SignatureMismatch => "signature_mismatch",
        }
    }
}

/// Shared-secret gate for mutating endpoints.
#[derive(Clone)]
pub struct HmacGate {
    secret: Option<Vec<u8>>,
    allow_unsigned: bool,
}

impl HmacGate {
    /// An empty or missing secret leaves the gate unconfigured, which
    /// rejects everything unless `allow_unsigned` is set.
    pub fn new(secret: Option<String>, allow_unsigned: bool) -> Self {
        let secret = secret
            .filter(|s| !s.trim().is_empty())
            .map(String::into_bytes);
        if secret.is_none() && allow_unsigned {
            warn!("HMAC verification DISABLED (OUTBOX_ALLOW_UNSIGNED); do not run this in production");
        }
        Self {
            secret,
            allow_unsigned,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Compute the signature a client should send for `body`. None when no
    /// secret is configured.
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.secret.as_deref()?;
        let mut mac = HmacSha256::new_from_slice(secret).ok()?;
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify `provided` against the raw body bytes. Comparison is
    /// constant time via `Mac::verify_slice`.
    pub fn verify(&self, body: &[u8], provided: Option<&str>) -> Result<(), HmacDenied> {
        let Some(secret) = self.secret.as_deref() else {
            if self.allow_unsigned {
                warn!("admitting unsigned request (OUTBOX_ALLOW_UNSIGNED)");
                return Ok(());
            }
            return Err(HmacDenied::SecretUnconfigured);
        };
        let Some(raw) = provided else {
            return Err(HmacDenied::MissingSignature);
        };
        let hex_sig = raw.strip_prefix("sha256=").unwrap_or(raw).trim();
        let sig = hex::decode(hex_sig).map_err(|_| HmacDenied::MalformedSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| HmacDenied::MalformedSignature)?;
        mac.update(body);
        mac.verify_slice(&sig)
            .map_err(|_| HmacDenied::SignatureMismatch)
    }
}

/// Pull the signature out of the supported headers, `X-Signature` first.
pub fn signature_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(HUB_SIGNATURE_HEADER))
        .and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> HmacGate {
        HmacGate::new(Some("test-secret".to_string()), false)
    }

    #[test]
    fn valid_signature_passes() {
        let g = gate();
        let body = br#"{"agent_id":"edge-1"}"#;
        let sig = g.sign(body).unwrap();
        assert!(g.verify(body, Some(&sig)).is_ok());
    }

    #[test]
    fn sha256_prefix_is_accepted() {
        let g = gate();
        let body = b"payload";
        let sig = format!("sha256={}", g.sign(body).unwrap());
        assert!(g.verify(body, Some(&sig)).is_ok());
    }

    #[test]
    fn tampered_body_fails() {
        let g = gate();
        let sig = g.sign(b"original").unwrap();
        assert_eq!(
            g.verify(b"tampered", Some(&sig)),
            Err(HmacDenied::SignatureMismatch)
        );
    }

    #[test]
    fn missing_signature_fails() {
        assert_eq!(
            gate().verify(b"x", None),
            Err(HmacDenied::MissingSignature)
        );
    }

    #[test]
    fn garbage_signature_is_malformed() {
        assert_eq!(
            gate().verify(b"x", Some("not-hex!")),
            Err(HmacDenied::MalformedSignature)
        );
    }

    #[test]
    fn unconfigured_secret_rejects_by_default() {
        let g = HmacGate::new(None, false);
        assert_eq!(g.verify(b"x", None), Err(HmacDenied::SecretUnconfigured));
        let g = HmacGate::new(Some("   ".to_string()), false);
        assert_eq!(g.verify(b"x", None), Err(HmacDenied::SecretUnconfigured));
    }

    #[test]
    fn explicit_unsigned_bypass_admits_everything() {
        let g = HmacGate::new(None, true);
        assert!(g.verify(b"x", None).is_ok());
        assert!(g.verify(b"x", Some("anything")).is_ok());
    }
}
