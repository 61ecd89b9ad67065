//! Webhook signature checks

use hmac::{Hmac, Mac};
use mailcast_common::{Error, Result};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verify a Mailgun webhook signature: hex HMAC-SHA256 of
/// `timestamp || token` keyed with the signing key.
pub fn verify_mailgun(signing_key: &str, timestamp: &str, token: &str, signature: &str) -> Result<()> {
    let expected = hex::decode(signature.trim())
        .map_err(|_| Error::Signature("signature is not hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| Error::Internal(format!("HMAC key error: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());

    mac.verify_slice(&expected)
        .map_err(|_| Error::Signature("mailgun signature mismatch".to_string()))
}

/// Compute a Mailgun-style signature
pub fn sign_mailgun(signing_key: &str, timestamp: &str, token: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|e| Error::Internal(format!("HMAC key error: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
