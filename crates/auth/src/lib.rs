//! `artforge-auth`: pure authentication boundary.
//!
//! Two inbound trust checks live here: bearer tokens for user sessions and
//! HMAC signatures for provider webhooks. This crate is intentionally decoupled
//! from HTTP and storage.

pub mod claims;
pub mod jwt;
pub mod webhook;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use webhook::{
    SignatureError, WebhookHeaders, WebhookSecret, WebhookVerifier, DEFAULT_TOLERANCE_SECS,
};
