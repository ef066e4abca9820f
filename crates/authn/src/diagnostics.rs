//! Unverified token inspection for debug pages.
//!
//! Nothing returned here is authenticated. Use [`AssertionVerifier`] for
//! any decision based on identity.
//!
//! [`AssertionVerifier`]: crate::verifier::AssertionVerifier

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Serialize;
use serde_json::Value;

use crate::{error::AuthError, token::MAX_TOKEN_LENGTH};

/// Header and claims of a token, decoded without checking the signature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnverifiedAssertion {
    /// Decoded JOSE header.
    pub header: Value,
    /// Decoded payload.
    pub claims: Value,
}

/// Decode a token's header and payload for display.
///
/// The signature segment is ignored, so tampered or truncated signatures
/// still decode.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the token is oversized, does not
/// have 3 segments, or the header or payload is not base64url JSON.
pub fn inspect_unverified(token: &str) -> Result<UnverifiedAssertion, AuthError> {
    if token.len() > MAX_TOKEN_LENGTH {
        return Err(AuthError::malformed_token(format!(
            "token exceeds maximum length of {MAX_TOKEN_LENGTH} bytes"
        )));
    }

    let parts: Vec<&str> = token.trim().split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::malformed_token("token must have 3 parts separated by dots"));
    }

    Ok(UnverifiedAssertion {
        header: decode_json(parts[0], "header")?,
        claims: decode_json(parts[1], "payload")?,
    })
}

fn decode_json(segment: &str, name: &str) -> Result<Value, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::malformed_token(format!("Failed to decode token {name}: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::malformed_token(format!("Failed to parse token {name}: {e}")))
}
