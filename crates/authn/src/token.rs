//! Compact assertion parsing and claim validation.
//!
//! [`AssertionToken::parse`] performs the structural checks only: three
//! base64url segments and a JSON header. Claims are decoded separately with
//! [`AssertionToken::claims`] so that callers can hold off on trusting the
//! payload until the signature has been verified.
//!
//! # Example
//!
//! ```
//! use iap_authn::token::AssertionToken;
//!
//! // {"alg":"ES256","kid":"k1"} . {"sub":"x"} . "sig"
//! let token = AssertionToken::parse("eyJhbGciOiJFUzI1NiIsImtpZCI6ImsxIn0.eyJzdWIiOiJ4In0.c2ln")?;
//! assert_eq!(token.header().alg, "ES256");
//! assert_eq!(token.header().kid.as_deref(), Some("k1"));
//! # Ok::<(), iap_authn::AuthError>(())
//! ```

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, Claim};

/// Maximum accepted assertion length in bytes.
///
/// IAP assertions are well under 2 KiB; anything this large is not one.
pub const MAX_TOKEN_LENGTH: usize = 16 * 1024;

/// Decoded JOSE header.
///
/// `alg` is kept as a string so that values the signature library does not
/// model (such as `none`) reach the algorithm policy instead of failing as
/// generic parse errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionHeader {
    /// Signing algorithm.
    pub alg: String,
    /// Key ID selecting the verification key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Token type, usually `JWT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// A parsed, not yet verified, compact assertion.
#[derive(Clone)]
pub struct AssertionToken {
    header: AssertionHeader,
    payload: Vec<u8>,
    signing_input: String,
    signature: String,
}

impl AssertionToken {
    /// Split and decode a compact assertion.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedToken`] if:
    /// - The token exceeds [`MAX_TOKEN_LENGTH`]
    /// - It does not have exactly 3 dot-separated segments
    /// - The header or payload segment is empty
    /// - Any segment is not unpadded base64url
    /// - The header is not a JSON object with a string `alg`
    pub fn parse(token: &str) -> Result<Self, AuthError> {
        if token.len() > MAX_TOKEN_LENGTH {
            return Err(AuthError::malformed_token(format!(
                "token exceeds maximum length of {MAX_TOKEN_LENGTH} bytes"
            )));
        }

        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::malformed_token("token must have 3 parts separated by dots"));
        };

        if header_b64.is_empty() || payload_b64.is_empty() {
            return Err(AuthError::malformed_token("token header and payload must not be empty"));
        }

        let header_bytes = decode_segment(header_b64, "header")?;
        let payload = decode_segment(payload_b64, "payload")?;
        // Decoded only to reject bad encodings here; verification consumes the text form.
        decode_segment(signature_b64, "signature")?;

        let header: AssertionHeader = serde_json::from_slice(&header_bytes).map_err(|e| {
            AuthError::malformed_token(format!("Failed to parse token header: {e}"))
        })?;

        Ok(Self {
            header,
            payload,
            signing_input: format!("{header_b64}.{payload_b64}"),
            signature: signature_b64.to_owned(),
        })
    }

    /// The decoded header.
    #[must_use]
    pub fn header(&self) -> &AssertionHeader {
        &self.header
    }

    /// The bytes the signature covers: `header.payload` exactly as received.
    #[must_use]
    pub fn signing_input(&self) -> &[u8] {
        self.signing_input.as_bytes()
    }

    /// The signature segment, still base64url encoded.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Decode the payload as [`IapClaims`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedToken`] if the payload is not valid JSON
    /// or required claims are missing or empty.
    pub fn claims(&self) -> Result<IapClaims, AuthError> {
        let claims: IapClaims = serde_json::from_slice(&self.payload).map_err(|e| {
            AuthError::malformed_token(format!("Failed to parse token claims: {e}"))
        })?;

        if claims.iss.is_empty() {
            return Err(AuthError::malformed_token("claim 'iss' is empty"));
        }
        if claims.sub.is_empty() {
            return Err(AuthError::malformed_token("claim 'sub' is empty"));
        }
        if claims.aud.is_empty() {
            return Err(AuthError::malformed_token("claim 'aud' is empty"));
        }

        Ok(claims)
    }
}

impl std::fmt::Debug for AssertionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionToken")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD.decode(segment).map_err(|e| {
        AuthError::malformed_token(format!("Failed to decode token {name}: {e}"))
    })
}

/// The `aud` claim, which JWT allows as a string or an array of strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// Single audience.
    Single(String),
    /// Multiple audiences.
    Multiple(Vec<String>),
}

impl Audience {
    /// Returns `true` if `expected` is one of the audiences.
    #[must_use]
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == expected,
            Audience::Multiple(auds) => auds.iter().any(|aud| aud == expected),
        }
    }

    /// Returns `true` if there is no non-empty audience.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Audience::Single(aud) => aud.is_empty(),
            Audience::Multiple(auds) => auds.iter().all(String::is_empty),
        }
    }
}

/// IAP-specific claims nested under `google`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogleClaims {
    /// Access Context Manager access levels the request satisfied.
    #[serde(default)]
    pub access_levels: Vec<String>,
}

/// Claims carried by an IAP assertion.
///
/// ```json
/// {
///   "iss": "https://cloud.google.com/iap",
///   "aud": "/projects/123/apps/demo",
///   "sub": "accounts.google.com:1234567890",
///   "email": "user@example.com",
///   "hd": "example.com",
///   "iat": 1700000000,
///   "exp": 1700000600
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IapClaims {
    /// Issuer, `https://cloud.google.com/iap` for IAP.
    pub iss: String,
    /// Audience: the backend service or App Engine app the token is scoped to.
    pub aud: Audience,
    /// Stable, unique user identifier.
    pub sub: String,
    /// User email address.
    pub email: String,
    /// Hosted domain (Google Workspace), if the account belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hd: Option<String>,
    /// Issued at (seconds since epoch).
    pub iat: i64,
    /// Expiration time (seconds since epoch).
    pub exp: i64,
    /// Not before (optional, seconds since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Signed nonce (IAP session binding), if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// IAP extension claims.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<GoogleClaims>,
}

/// What the claims must match.
#[derive(Clone, Copy, Debug)]
pub struct ClaimExpectations<'a> {
    /// Required `iss`.
    pub issuer: &'a str,
    /// Required member of `aud`.
    pub audience: &'a str,
    /// Tolerance applied to `exp`, `nbf` and `iat`.
    pub leeway: Duration,
}

/// Validate issuer, audience and time-window claims against `now`.
///
/// A token is accepted while `now <= exp + leeway`, and rejected if
/// `nbf` or `iat` is later than `now + leeway`.
///
/// # Errors
///
/// Returns [`AuthError::ClaimValidationFailed`] naming the first failing claim.
pub fn validate_claims(
    claims: &IapClaims,
    expected: &ClaimExpectations<'_>,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    let now = now.timestamp();
    let leeway = i64::try_from(expected.leeway.as_secs()).unwrap_or(i64::MAX);

    if claims.iss != expected.issuer {
        return Err(AuthError::claim_validation_failed(
            Claim::Issuer,
            format!("expected '{}', got '{}'", expected.issuer, claims.iss),
        ));
    }

    if !claims.aud.contains(expected.audience) {
        return Err(AuthError::claim_validation_failed(
            Claim::Audience,
            format!("expected '{}'", expected.audience),
        ));
    }

    if now > claims.exp.saturating_add(leeway) {
        return Err(AuthError::claim_validation_failed(
            Claim::Expiry,
            format!("token expired {}s ago", now.saturating_sub(claims.exp)),
        ));
    }

    if let Some(nbf) = claims.nbf
        && nbf > now.saturating_add(leeway)
    {
        return Err(AuthError::claim_validation_failed(
            Claim::NotBefore,
            format!("token not valid for another {}s", nbf.saturating_sub(now)),
        ));
    }

    if claims.iat > now.saturating_add(leeway) {
        return Err(AuthError::claim_validation_failed(
            Claim::IssuedAt,
            format!("token issued {}s in the future", claims.iat.saturating_sub(now)),
        ));
    }

    Ok(())
}
