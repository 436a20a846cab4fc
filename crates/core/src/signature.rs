use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

const ALGORITHM_PREFIX: &str = "sha256=";

/// Key setup failed; a mismatching signature is never reported as an error.
#[derive(Debug, Error)]
#[error("failed to initialize signature verifier")]
pub struct SignatureError;

/// Checks `provided` against HMAC-SHA256 of the raw `body` keyed by `secret`.
///
/// The signature is hex encoded and may carry a `sha256=` prefix. Malformed
/// signatures compare as a mismatch.
pub fn verify_signature(
    body: &[u8],
    provided: &str,
    secret: &[u8],
) -> Result<bool, SignatureError> {
    let expected = compute(body, secret)?;

    let trimmed = provided.trim();
    let hex_part = match trimmed.get(..ALGORITHM_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(ALGORITHM_PREFIX) => {
            &trimmed[ALGORITHM_PREFIX.len()..]
        }
        _ => trimmed,
    };

    let Ok(provided_bytes) = hex::decode(hex_part) else {
        return Ok(false);
    };

    Ok(expected.as_slice().ct_eq(provided_bytes.as_slice()).into())
}

/// Produces the prefixed signature the provider would send for `body`.
pub fn sign(body: &[u8], secret: &[u8]) -> Result<String, SignatureError> {
    let digest = compute(body, secret)?;
    Ok(format!("{ALGORITHM_PREFIX}{}", hex::encode(digest)))
}

fn compute(body: &[u8], secret: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| SignatureError)?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}
