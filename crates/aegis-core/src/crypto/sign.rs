//! HMAC-SHA256 request signing.
//!
//! The signed message is the concatenation
//! `decimal(timestamp_seconds) || "." || canonical_payload`. Both the
//! signer and the verifier must build the identical byte sequence; payload
//! canonicalisation is the caller's responsibility (see
//! [`crate::command::canonical_signing_payload`]).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Errors raised by the signing primitives.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignError {
    /// Signing was requested without a shared key.
    #[error("signing key is missing")]
    MissingSecret,
}

/// Sign `payload` for `timestamp_seconds` with the tenant shared key.
///
/// Returns the base64 encoding (no newlines) of
/// `HMAC-SHA256(shared_key, "<timestamp>.<payload>")`.
///
/// # Errors
///
/// Returns [`SignError::MissingSecret`] if `shared_key` is empty.
pub fn sign_payload(
    shared_key: &str,
    payload: &[u8],
    timestamp_seconds: i64,
) -> Result<String, SignError> {
    if shared_key.is_empty() {
        return Err(SignError::MissingSecret);
    }

    let mut mac = HmacSha256::new_from_slice(shared_key.as_bytes())
        .map_err(|_| SignError::MissingSecret)?;
    mac.update(timestamp_seconds.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Verify a signature produced by [`sign_payload`].
///
/// The comparison is constant-time over the base64 text. Returns `false`
/// for an empty key rather than erroring: a verifier without a key can
/// never accept.
#[must_use]
pub fn verify_payload(
    shared_key: &str,
    payload: &[u8],
    timestamp_seconds: i64,
    signature: &str,
) -> bool {
    if shared_key.is_empty() {
        return false;
    }
    let Ok(expected) = sign_payload(shared_key, payload, timestamp_seconds) else {
        return false;
    };
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}
