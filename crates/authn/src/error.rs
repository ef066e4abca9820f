//! Verification error types.
//!
//! Every failure the verifier can produce is an [`AuthError`]. Variants are
//! grouped into five coarse [`ErrorKind`]s that callers use to decide how to
//! respond; the variants themselves carry diagnostic detail for logs.
//!
//! Display strings never include the raw assertion or key material, so an
//! error can always be logged as-is.

use std::{fmt, sync::Arc};

use thiserror::Error;

/// Type-erased error source, shared so that [`AuthError`] stays `Clone`.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// The claim that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Claim {
    /// `iss` did not equal the expected issuer.
    Issuer,
    /// `aud` did not contain the expected audience.
    Audience,
    /// `exp` is in the past (beyond the clock-skew tolerance).
    Expiry,
    /// `nbf` is in the future (beyond the clock-skew tolerance).
    NotBefore,
    /// `iat` is in the future (beyond the clock-skew tolerance).
    IssuedAt,
}

impl Claim {
    /// Returns the registered JWT claim name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Claim::Issuer => "iss",
            Claim::Audience => "aud",
            Claim::Expiry => "exp",
            Claim::NotBefore => "nbf",
            Claim::IssuedAt => "iat",
        }
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coarse classification of an [`AuthError`].
///
/// All kinds are terminal for the request being verified. Only
/// [`ErrorKind::KeySetUnavailable`] is transient: the caller may retry the
/// whole request later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Structurally invalid token, disallowed algorithm, or undecodable claims.
    MalformedToken,
    /// The `kid` is absent from the current key set even after a forced refresh.
    UnknownSigningKey,
    /// The signature does not verify against the resolved key.
    InvalidSignature,
    /// Issuer, audience, or time-window validation failed.
    ClaimValidationFailed,
    /// The key set could not be fetched and no usable cached set exists.
    KeySetUnavailable,
}

/// Assertion verification errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; downstream match expressions must
/// include a wildcard arm. Prefer matching on [`AuthError::kind`].
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Token cannot be split, decoded, or parsed.
    #[error("Malformed token: {message}")]
    MalformedToken {
        /// What was wrong with the token structure.
        message: String,
    },

    /// Header algorithm is forbidden or not on the allow-list.
    #[error("Unsupported algorithm: {message}")]
    UnsupportedAlgorithm {
        /// Why the algorithm was rejected.
        message: String,
    },

    /// No key with this `kid` after a forced refresh.
    #[error("Unknown signing key: {kid}")]
    UnknownSigningKey {
        /// Key ID from the token header.
        kid: String,
    },

    /// Signature did not verify.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Resolved key cannot verify the token's declared algorithm.
    #[error("Signing key {kid} cannot verify algorithm {alg}")]
    KeyAlgorithmMismatch {
        /// Key ID of the resolved key.
        kid: String,
        /// Algorithm declared in the token header.
        alg: String,
    },

    /// A registered claim failed validation.
    #[error("Claim validation failed ({claim}): {message}")]
    ClaimValidationFailed {
        /// The claim that failed.
        claim: Claim,
        /// Diagnostic detail. Never shown to the requester.
        message: String,
    },

    /// Key set fetch failed with no usable cached copy.
    #[error("Key set unavailable: {message}")]
    KeySetUnavailable {
        /// What went wrong.
        message: String,
        /// Underlying transport or parse error, if any.
        #[source]
        source: Option<BoxError>,
    },
}

impl AuthError {
    /// Creates a [`AuthError::MalformedToken`].
    #[must_use]
    pub fn malformed_token(message: impl Into<String>) -> Self {
        Self::MalformedToken { message: message.into() }
    }

    /// Creates a [`AuthError::UnsupportedAlgorithm`].
    #[must_use]
    pub fn unsupported_algorithm(message: impl Into<String>) -> Self {
        Self::UnsupportedAlgorithm { message: message.into() }
    }

    /// Creates a [`AuthError::UnknownSigningKey`].
    #[must_use]
    pub fn unknown_signing_key(kid: impl Into<String>) -> Self {
        Self::UnknownSigningKey { kid: kid.into() }
    }

    /// Creates a [`AuthError::InvalidSignature`].
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::InvalidSignature
    }

    /// Creates a [`AuthError::KeyAlgorithmMismatch`].
    #[must_use]
    pub fn key_algorithm_mismatch(kid: impl Into<String>, alg: impl Into<String>) -> Self {
        Self::KeyAlgorithmMismatch { kid: kid.into(), alg: alg.into() }
    }

    /// Creates a [`AuthError::ClaimValidationFailed`].
    #[must_use]
    pub fn claim_validation_failed(claim: Claim, message: impl Into<String>) -> Self {
        Self::ClaimValidationFailed { claim, message: message.into() }
    }

    /// Creates a [`AuthError::KeySetUnavailable`] without a source.
    #[must_use]
    pub fn key_set_unavailable(message: impl Into<String>) -> Self {
        Self::KeySetUnavailable { message: message.into(), source: None }
    }

    /// Creates a [`AuthError::KeySetUnavailable`] wrapping the underlying error.
    #[must_use]
    pub fn key_set_unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::KeySetUnavailable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns the coarse classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::MalformedToken { .. } | AuthError::UnsupportedAlgorithm { .. } => {
                ErrorKind::MalformedToken
            },
            AuthError::UnknownSigningKey { .. } => ErrorKind::UnknownSigningKey,
            AuthError::InvalidSignature | AuthError::KeyAlgorithmMismatch { .. } => {
                ErrorKind::InvalidSignature
            },
            AuthError::ClaimValidationFailed { .. } => ErrorKind::ClaimValidationFailed,
            AuthError::KeySetUnavailable { .. } => ErrorKind::KeySetUnavailable,
        }
    }

    /// Returns `true` if retrying the whole request later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::KeySetUnavailable
    }

    /// Returns the failed claim for [`AuthError::ClaimValidationFailed`].
    #[must_use]
    pub fn failed_claim(&self) -> Option<Claim> {
        match self {
            AuthError::ClaimValidationFailed { claim, .. } => Some(*claim),
            _ => None,
        }
    }
}

/// Result type alias for verification operations.
pub type Result<T> = std::result::Result<T, AuthError>;
