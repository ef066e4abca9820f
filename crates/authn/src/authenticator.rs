//! Request-level authentication behind IAP.
//!
//! [`IapAuthenticator`] reads the `X-Goog-IAP-JWT-Assertion` header and
//! verifies it with the configured audience and issuer. Only the signed
//! assertion is trusted; the unsigned `X-Goog-Authenticated-User-*` headers
//! are never read.
//!
//! # Example
//!
//! ```no_run
//! use http::HeaderMap;
//! use iap_authn::{IapAuthenticator, IapConfig};
//!
//! # async fn example(headers: HeaderMap) -> Result<(), Box<dyn std::error::Error>> {
//! let config = IapConfig::from_env()?;
//! let authenticator = IapAuthenticator::new(&config)?;
//!
//! match authenticator.authenticate(&headers).await? {
//!     Some(identity) => println!("Hello {}", identity.email),
//!     None => println!("Hello anonymous"),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use http::HeaderMap;

use crate::{
    config::{ConfigError, IapConfig},
    error::AuthError,
    key_set_cache::KeySetCache,
    key_source::HttpKeySetSource,
    verifier::{AssertionVerifier, VerifiedIdentity},
};

/// Header carrying the IAP signed assertion.
pub const IAP_ASSERTION_HEADER: &str = "x-goog-iap-jwt-assertion";

/// Extracts the assertion from request headers.
///
/// Returns `Ok(None)` when the header is absent.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] if the header is repeated or its
/// value is not visible ASCII.
pub fn assertion_from_headers(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let mut values = headers.get_all(IAP_ASSERTION_HEADER).iter();
    let Some(value) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        return Err(AuthError::malformed_token("multiple assertion headers"));
    }

    let token = value
        .to_str()
        .map_err(|_| AuthError::malformed_token("assertion header is not valid ASCII"))?;
    Ok(Some(token.trim()))
}

/// Authenticates requests that passed through IAP.
#[derive(Debug, Clone)]
pub struct IapAuthenticator {
    verifier: Arc<AssertionVerifier>,
    audience: String,
    issuer: String,
}

impl IapAuthenticator {
    /// Builds the HTTP key source, cache and verifier described by `config`.
    ///
    /// Starts the background refresh task when `refresh_interval` is set, in
    /// which case this must run inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the HTTP client cannot be
    /// built.
    pub fn new(config: &IapConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let source = HttpKeySetSource::new(config.key_set_url(), config.fetch_timeout())?;
        let mut cache = Arc::new(
            KeySetCache::new(Arc::new(source), config.key_set_ttl())
                .with_stale_grace(config.stale_grace())
                .with_fetch_timeout(config.fetch_timeout()),
        );
        if let Some(interval) = config.refresh_interval() {
            cache = cache.with_refresh_interval(interval);
        }

        let verifier = AssertionVerifier::new(cache)
            .with_algorithms(config.algorithms().to_vec())
            .with_clock_skew(config.clock_skew());

        tracing::info!(
            audience = config.audience(),
            endpoint = config.key_set_url(),
            "IAP authenticator configured"
        );
        Ok(Self::with_verifier(Arc::new(verifier), config.audience(), config.issuer()))
    }

    /// Wraps an existing verifier.
    #[must_use]
    pub fn with_verifier(
        verifier: Arc<AssertionVerifier>,
        audience: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        Self { verifier, audience: audience.into(), issuer: issuer.into() }
    }

    /// Verifies the request's assertion header.
    ///
    /// Returns `Ok(None)` when the request carries no assertion, meaning it
    /// did not come through IAP.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] from header extraction or verification.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<VerifiedIdentity>, AuthError> {
        match assertion_from_headers(headers)? {
            Some(token) => self.verify(token).await.map(Some),
            None => {
                tracing::debug!("request has no IAP assertion");
                Ok(None)
            },
        }
    }

    /// Verifies a bare assertion with the configured audience and issuer.
    ///
    /// # Errors
    ///
    /// See [`AssertionVerifier::verify`].
    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        self.verifier.verify(token, &self.audience, &self.issuer).await
    }

    /// The underlying verifier.
    #[must_use]
    pub fn verifier(&self) -> &Arc<AssertionVerifier> {
        &self.verifier
    }

    /// The expected audience.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Stops the key cache's background refresh task.
    pub async fn shutdown(&self) {
        self.verifier.key_cache().shutdown().await;
    }
}
