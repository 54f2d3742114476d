//! Provider webhook signature verification.
//!
//! The provider signs `{webhook-id}.{webhook-timestamp}.{raw body}` with
//! HMAC-SHA256 and sends one or more `v1,<base64>` candidates (space separated)
//! in `webhook-signature`; more than one appears while keys are being rotated.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_ID: &str = "webhook-id";
pub const HEADER_SIGNATURE: &str = "webhook-signature";
pub const HEADER_TIMESTAMP: &str = "webhook-timestamp";

/// Maximum accepted distance between the signed timestamp and our clock.
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

const SECRET_PREFIX: &str = "whsec_";
const SIGNATURE_VERSION: &str = "v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("timestamp is not an integer")]
    InvalidTimestamp,

    #[error("timestamp outside tolerance ({skew_secs}s skew)")]
    StaleTimestamp { skew_secs: u64 },

    #[error("no signature candidate matched")]
    NoMatchingSignature,

    #[error("invalid webhook secret: {0}")]
    InvalidSecret(String),
}

impl SignatureError {
    /// Header-shape failures, as opposed to a well-formed but wrong signature.
    pub fn is_missing_header(&self) -> bool {
        matches!(self, Self::MissingHeader(_))
    }
}

/// Decoded shared secret.
#[derive(Clone)]
pub struct WebhookSecret(Vec<u8>);

impl WebhookSecret {
    /// Parse a secret as issued by the provider (`whsec_<base64>`).
    ///
    /// Secrets without the prefix are used as raw bytes.
    pub fn parse(raw: &str) -> Result<Self, SignatureError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SignatureError::InvalidSecret("empty".to_string()));
        }
        match raw.strip_prefix(SECRET_PREFIX) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Self)
                .map_err(|e| SignatureError::InvalidSecret(e.to_string())),
            None => Ok(Self(raw.as_bytes().to_vec())),
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl core::fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("WebhookSecret(**redacted**)")
    }
}

/// The three signature headers, borrowed from whatever transport carried them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebhookHeaders<'a> {
    pub id: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
}

impl<'a> WebhookHeaders<'a> {
    /// Collect the headers through a case-insensitive lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<&'a str>) -> Self {
        Self {
            id: lookup(HEADER_ID),
            signature: lookup(HEADER_SIGNATURE),
            timestamp: lookup(HEADER_TIMESTAMP),
        }
    }

    fn require(&self) -> Result<(&'a str, &'a str, &'a str), SignatureError> {
        let id = non_blank(self.id).ok_or(SignatureError::MissingHeader(HEADER_ID))?;
        let signature =
            non_blank(self.signature).ok_or(SignatureError::MissingHeader(HEADER_SIGNATURE))?;
        let timestamp =
            non_blank(self.timestamp).ok_or(SignatureError::MissingHeader(HEADER_TIMESTAMP))?;
        Ok((id, signature, timestamp))
    }
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}

/// Stateless verifier bound to one shared secret.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: WebhookSecret,
    tolerance_secs: u64,
}

impl WebhookVerifier {
    pub fn new(secret: WebhookSecret) -> Self {
        Self {
            secret,
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance_secs(mut self, tolerance_secs: u64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Boolean form of [`Self::verify`].
    pub fn is_authentic(
        &self,
        raw_body: &[u8],
        headers: &WebhookHeaders<'_>,
        now: DateTime<Utc>,
    ) -> bool {
        self.verify(raw_body, headers, now).is_ok()
    }

    pub fn verify(
        &self,
        raw_body: &[u8],
        headers: &WebhookHeaders<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let (id, signature_header, timestamp) = headers.require()?;

        let signed_at: i64 = timestamp
            .parse()
            .map_err(|_| SignatureError::InvalidTimestamp)?;
        let skew_secs = now.timestamp().abs_diff(signed_at);
        if skew_secs > self.tolerance_secs {
            return Err(SignatureError::StaleTimestamp { skew_secs });
        }

        let expected = self.mac(id, timestamp, raw_body)?;

        // Check every candidate so timing does not reveal which one matched.
        let mut matched = false;
        for candidate in signature_header.split_whitespace() {
            let Some((version, encoded)) = candidate.split_once(',') else {
                continue;
            };
            if version != SIGNATURE_VERSION {
                continue;
            }
            let Ok(decoded) = STANDARD.decode(encoded) else {
                continue;
            };
            if decoded.len() == expected.len() {
                matched |= bool::from(decoded.ct_eq(&expected));
            }
        }

        if matched {
            Ok(())
        } else {
            Err(SignatureError::NoMatchingSignature)
        }
    }

    /// Produce a `v1,<base64>` signature candidate for the given triple.
    pub fn sign(
        &self,
        webhook_id: &str,
        timestamp: &str,
        raw_body: &[u8],
    ) -> Result<String, SignatureError> {
        let mac = self.mac(webhook_id, timestamp, raw_body)?;
        Ok(format!("{SIGNATURE_VERSION},{}", STANDARD.encode(mac)))
    }

    fn mac(&self, id: &str, timestamp: &str, raw_body: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret.0)
            .map_err(|e| SignatureError::InvalidSecret(e.to_string()))?;
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(raw_body);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
