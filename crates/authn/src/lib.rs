//! # IAP Authentication
//!
//! Verification of Google Cloud Identity-Aware Proxy (IAP) signed assertions.
//!
//! This crate provides:
//! - **Assertion verification**: signature, issuer, audience and time checks against IAP's
//!   published keys
//! - **Key-set cache**: TTL cache with single-flight refresh, forced refresh on unknown key IDs,
//!   and stale fallback during endpoint outages
//! - **Algorithm validation**: security checks for assertion algorithms
//! - **Request authentication**: extraction of the `X-Goog-IAP-JWT-Assertion` header
//!
//! ## Features
//!
//! - Only asymmetric algorithms are supported; IAP signs with ES256
//! - `none` and symmetric algorithms (HS256, etc.) are rejected before any key lookup
//! - JWKS, PEM public-key maps and X.509 certificate maps are all accepted as key sets
//!
//! ## Example
//!
//! ```no_run
//! use iap_authn::{IapAuthenticator, IapConfig};
//!
//! # async fn example(token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let config = IapConfig::builder().audience("/projects/123/apps/demo").build()?;
//! let authenticator = IapAuthenticator::new(&config)?;
//!
//! let identity = authenticator.verify(token).await?;
//! println!("Verified {} ({})", identity.email, identity.subject);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Request authentication from headers.
pub mod authenticator;
/// Configuration.
pub mod config;
/// Unverified token inspection.
pub mod diagnostics;
/// Authentication error types.
pub mod error;
/// Published signing keys.
pub mod key_set;
/// Key-set cache with stale fallback.
pub mod key_set_cache;
/// Key-set sources.
pub mod key_source;
/// Test helpers: key generation, signed assertions, fake key sources.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// Assertion parsing and claim validation.
pub mod token;
/// Algorithm validation.
pub mod validation;
/// Signed-assertion verification.
pub mod verifier;

// Re-export key types for convenience
pub use authenticator::{IAP_ASSERTION_HEADER, IapAuthenticator};
pub use config::{ConfigError, IapConfig};
pub use diagnostics::{UnverifiedAssertion, inspect_unverified};
pub use error::{AuthError, Claim, ErrorKind, Result};
pub use key_set::{SigningKeySet, VerificationKey};
pub use key_set_cache::{DEFAULT_KEY_SET_TTL, DEFAULT_STALE_GRACE, KeySetCache};
pub use key_source::{HttpKeySetSource, KeySetSource};
pub use token::IapClaims;
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
pub use verifier::{AssertionVerifier, VerifiedIdentity};
