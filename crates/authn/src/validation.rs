//! Header algorithm and key ID validation.
//!
//! These checks run on the untrusted token header before any key lookup, so
//! a forged header can never cause a key-set fetch or reach the signature
//! primitive with an algorithm the verifier did not opt into.
//!
//! # Security
//!
//! - `none` and the symmetric HMAC algorithms are always rejected, regardless of configuration
//! - Every other algorithm must be on the configured allow-list
//! - Key IDs are bounded in length and may not contain control characters

use std::str::FromStr;

use jsonwebtoken::Algorithm;

use crate::error::AuthError;

/// Algorithms that are never accepted.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: symmetric, so anyone holding the verification key could also mint
///   tokens
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Asymmetric algorithms the verifier knows how to check.
///
/// The configured allow-list must be a subset of this list. IAP signs with
/// `ES256`; the others cover issuers publishing RSA or Ed25519 keys.
pub const ACCEPTED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::EdDSA,
];

/// Maximum accepted key ID length in bytes.
pub const MAX_KID_LENGTH: usize = 256;

/// Validate a header `alg` value against the security policy and `allowed`.
///
/// The forbidden list is checked first so that `none` and `HS*` are reported
/// as security rejections even when `allowed` is misconfigured.
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] if `alg` is forbidden, unknown,
/// or not in `allowed`.
///
/// # Examples
///
/// ```
/// use iap_authn::validation::validate_algorithm;
/// use jsonwebtoken::Algorithm;
///
/// assert_eq!(validate_algorithm("ES256", &[Algorithm::ES256]).ok(), Some(Algorithm::ES256));
/// assert!(validate_algorithm("none", &[Algorithm::ES256]).is_err());
/// assert!(validate_algorithm("RS256", &[Algorithm::ES256]).is_err());
/// ```
pub fn validate_algorithm(alg: &str, allowed: &[Algorithm]) -> Result<Algorithm, AuthError> {
    if FORBIDDEN_ALGORITHMS.iter().any(|forbidden| forbidden.eq_ignore_ascii_case(alg)) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    let algorithm = Algorithm::from_str(alg).map_err(|_| {
        AuthError::unsupported_algorithm(format!("Algorithm '{}' is not recognized", sanitize(alg)))
    })?;

    if !ACCEPTED_ALGORITHMS.contains(&algorithm) || !allowed.contains(&algorithm) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not in accepted list"
        )));
    }

    Ok(algorithm)
}

/// Validate a header `kid` value.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the key ID is empty, longer than
/// [`MAX_KID_LENGTH`], or contains control characters.
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() {
        return Err(AuthError::malformed_token("kid must not be empty"));
    }
    if kid.len() > MAX_KID_LENGTH {
        return Err(AuthError::malformed_token(format!(
            "kid exceeds maximum length of {MAX_KID_LENGTH} bytes"
        )));
    }
    if kid.chars().any(char::is_control) {
        return Err(AuthError::malformed_token("kid contains control characters"));
    }
    Ok(())
}

/// Truncate attacker-controlled text before it lands in an error message.
fn sanitize(value: &str) -> String {
    const LIMIT: usize = 32;
    let cleaned: String = value.chars().filter(|c| !c.is_control()).take(LIMIT).collect();
    if value.chars().count() > LIMIT { format!("{cleaned}...") } else { cleaned }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_validate_algorithm_es256_accepted() {
        assert_eq!(validate_algorithm("ES256", &[Algorithm::ES256]).unwrap(), Algorithm::ES256);
    }

    #[test]
    fn test_validate_algorithm_not_in_configured_list() {
        // RS256 is verifiable but this verifier only opted into ES256
        let result = validate_algorithm("RS256", &[Algorithm::ES256]);
        assert!(
            matches!(result, Err(AuthError::UnsupportedAlgorithm { ref message }) if message.contains("not in accepted list"))
        );
    }

    #[rstest]
    #[case("none")]
    #[case("None")]
    #[case("NONE")]
    #[case("HS256")]
    #[case("HS384")]
    #[case("HS512")]
    fn test_forbidden_algorithms_rejected_with_security_message(#[case] alg: &str) {
        let result = validate_algorithm(alg, ACCEPTED_ALGORITHMS);
        assert!(
            matches!(result, Err(AuthError::UnsupportedAlgorithm { ref message }) if message.contains("not allowed for security reasons")),
            "Expected security rejection for forbidden algorithm '{alg}'"
        );
    }

    #[test]
    fn test_forbidden_even_if_configured() {
        // A misconfigured allow-list must not re-enable HMAC
        let result = validate_algorithm("HS256", &[Algorithm::HS256]);
        assert!(matches!(result, Err(AuthError::UnsupportedAlgorithm { .. })));
    }

    #[test]
    fn test_unknown_algorithm_message_is_truncated() {
        let alg = "X".repeat(500);
        let err = validate_algorithm(&alg, ACCEPTED_ALGORITHMS).unwrap_err();
        assert!(err.to_string().len() < 100, "error message should be bounded: {err}");
    }

    #[test]
    fn test_every_accepted_algorithm_passes_when_allowed() {
        for alg in ACCEPTED_ALGORITHMS {
            let name = format!("{alg:?}");
            assert_eq!(validate_algorithm(&name, ACCEPTED_ALGORITHMS).unwrap(), *alg);
        }
    }

    #[test]
    fn test_accepted_algorithms_are_asymmetric() {
        for alg in ACCEPTED_ALGORITHMS {
            let name = format!("{alg:?}");
            assert!(!name.starts_with("HS"), "{name} must not be accepted");
        }
    }

    #[rstest]
    #[case("abc123")]
    #[case("0dd2b1e3a1f04a5d9c2e")]
    #[case("key-2024-001")]
    fn test_validate_kid_accepts(#[case] kid: &str) {
        assert!(validate_kid(kid).is_ok());
    }

    #[rstest]
    #[case::empty("")]
    #[case::newline("key\nid")]
    #[case::nul("key\0id")]
    #[case::escape("key\x1bid")]
    fn test_validate_kid_rejects(#[case] kid: &str) {
        assert!(matches!(validate_kid(kid), Err(AuthError::MalformedToken { .. })));
    }

    #[test]
    fn test_validate_kid_length_boundary() {
        assert!(validate_kid(&"k".repeat(MAX_KID_LENGTH)).is_ok());
        assert!(validate_kid(&"k".repeat(MAX_KID_LENGTH + 1)).is_err());
    }
}
