//! HMAC-SHA256 request signing.
//!
//! The signature is the lowercase hex HMAC of the exact request body bytes.
//! Receivers must recompute it over the raw body, before any JSON parsing,
//! and compare in constant time.

use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use maprelay_core::{RelayError, Result};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
/// Header carrying the event name.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the ISO-8601 send time.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
/// Header carrying the correlation id shared by all attempts of one delivery.
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Id";

/// Sign `body` with `secret`.
///
/// # Errors
///
/// Returns `RelayError::Configuration` if the MAC cannot be keyed.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| RelayError::Configuration(format!("Failed to initialize HMAC: {e}")))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check `signature` against `body` in constant time.
///
/// Accepts the bare hex digest or a `sha256=` prefixed one.
#[must_use]
pub fn verify(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(expected) = sign(secret, body) else {
        return false;
    };
    let provided = signature.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    constant_time_eq(expected.as_bytes(), provided.to_ascii_lowercase().as_bytes())
}
