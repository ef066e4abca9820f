//! Signed-assertion verification.
//!
//! [`AssertionVerifier`] turns a compact token from the
//! `X-Goog-IAP-JWT-Assertion` header into a [`VerifiedIdentity`]:
//!
//! 1. Parse the three segments and the header
//! 2. Reject `none`, symmetric and non-allow-listed algorithms, and bad `kid`s, before any key
//!    lookup
//! 3. Resolve the key through the [`KeySetCache`]
//! 4. Verify the signature over `header.payload`
//! 5. Decode and validate the claims
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use iap_authn::{AssertionVerifier, HttpKeySetSource, KeySetCache, key_source::IAP_JWK_URL};
//!
//! # async fn example(token: &str) -> Result<(), iap_authn::AuthError> {
//! let source = HttpKeySetSource::new(IAP_JWK_URL, Duration::from_secs(5))?;
//! let cache = Arc::new(KeySetCache::new(Arc::new(source), Duration::from_secs(300)));
//! let verifier = AssertionVerifier::new(cache);
//!
//! let identity = verifier
//!     .verify(token, "/projects/123/apps/demo", "https://cloud.google.com/iap")
//!     .await?;
//! println!("authenticated {}", identity.email);
//! # Ok(())
//! # }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, crypto};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    error::AuthError,
    key_set_cache::KeySetCache,
    token::{AssertionToken, ClaimExpectations, IapClaims, validate_claims},
    validation::{validate_algorithm, validate_kid},
};

/// Default tolerance for clock differences between IAP and this host.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5);

/// Minimum spacing between forgery warnings.
const FORGERY_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Identity asserted by a token that passed every check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    /// User email address.
    pub email: String,
    /// Stable subject identifier, e.g. `accounts.google.com:1234567890`.
    pub subject: String,
    /// The audience the token was verified against.
    pub audience: String,
    /// The token issuer.
    pub issuer: String,
    /// Google Workspace domain, if any.
    pub hosted_domain: Option<String>,
    /// Access levels from the `google` claim; empty when absent.
    pub access_levels: Vec<String>,
    /// When IAP issued the assertion.
    pub issued_at: DateTime<Utc>,
    /// When the assertion expires.
    pub expires_at: DateTime<Utc>,
}

impl VerifiedIdentity {
    fn from_claims(claims: IapClaims, audience: &str) -> Result<Self, AuthError> {
        let timestamp = |secs: i64, name: &str| {
            DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                AuthError::malformed_token(format!("'{name}' is out of range: {secs}"))
            })
        };

        Ok(Self {
            issued_at: timestamp(claims.iat, "iat")?,
            expires_at: timestamp(claims.exp, "exp")?,
            email: claims.email,
            subject: claims.sub,
            audience: audience.to_string(),
            issuer: claims.iss,
            hosted_domain: claims.hd.filter(|hd| !hd.is_empty()),
            access_levels: claims.google.map(|google| google.access_levels).unwrap_or_default(),
        })
    }
}

/// Throttles forgery warnings to one line per interval.
#[derive(Debug, Default)]
struct ForgeryLog {
    last_logged: Option<Instant>,
    suppressed: u64,
}

impl ForgeryLog {
    /// Returns the number of suppressed events to report if a line should be
    /// emitted now, or `None` to suppress this one.
    fn record(&mut self, now: Instant) -> Option<u64> {
        match self.last_logged {
            Some(last) if now.saturating_duration_since(last) < FORGERY_LOG_INTERVAL => {
                self.suppressed += 1;
                None
            },
            _ => {
                self.last_logged = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            },
        }
    }
}

/// Verifies IAP signed assertions against a shared [`KeySetCache`].
///
/// Cheap to share: all state besides the cache is a counter and a log
/// throttle. Verification holds no locks across the signature check.
pub struct AssertionVerifier {
    key_cache: Arc<KeySetCache>,
    algorithms: Vec<Algorithm>,
    clock_skew: Duration,
    signature_failures: AtomicU64,
    forgery_log: Mutex<ForgeryLog>,
}

impl AssertionVerifier {
    /// Creates a verifier accepting ES256 with the default clock skew.
    #[must_use]
    pub fn new(key_cache: Arc<KeySetCache>) -> Self {
        Self {
            key_cache,
            algorithms: vec![Algorithm::ES256],
            clock_skew: DEFAULT_CLOCK_SKEW,
            signature_failures: AtomicU64::new(0),
            forgery_log: Mutex::new(ForgeryLog::default()),
        }
    }

    /// Replaces the algorithm allow-list.
    ///
    /// `none` and `HS*` are rejected regardless of this list.
    #[must_use]
    pub fn with_algorithms(mut self, algorithms: impl Into<Vec<Algorithm>>) -> Self {
        self.algorithms = algorithms.into();
        self
    }

    /// Sets the tolerance applied to `exp`, `nbf` and `iat`.
    #[must_use]
    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }

    /// The cache keys are resolved through.
    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeySetCache> {
        &self.key_cache
    }

    /// The algorithm allow-list.
    #[must_use]
    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    /// The configured clock skew.
    #[must_use]
    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Number of tokens rejected for a bad signature since construction.
    #[must_use]
    pub fn signature_failures(&self) -> u64 {
        self.signature_failures.load(Ordering::Relaxed)
    }

    /// Verify `token` against the current time.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The token is malformed or declares a disallowed algorithm ([`AuthError::MalformedToken`],
    ///   [`AuthError::UnsupportedAlgorithm`])
    /// - No published key has the token's `kid` ([`AuthError::UnknownSigningKey`])
    /// - The key set could not be obtained ([`AuthError::KeySetUnavailable`])
    /// - The signature does not verify ([`AuthError::InvalidSignature`],
    ///   [`AuthError::KeyAlgorithmMismatch`])
    /// - A claim check fails ([`AuthError::ClaimValidationFailed`])
    pub async fn verify(
        &self,
        token: &str,
        expected_audience: &str,
        expected_issuer: &str,
    ) -> Result<VerifiedIdentity, AuthError> {
        self.verify_at(token, expected_audience, expected_issuer, Utc::now()).await
    }

    /// Verify `token` as of `now`.
    ///
    /// # Errors
    ///
    /// Same as [`verify`](Self::verify).
    #[tracing::instrument(
        skip_all,
        fields(audience = expected_audience, kid = tracing::field::Empty)
    )]
    pub async fn verify_at(
        &self,
        token: &str,
        expected_audience: &str,
        expected_issuer: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedIdentity, AuthError> {
        let token = AssertionToken::parse(token)?;
        let header = token.header();

        // Algorithm and kid are checked before any key lookup
        let algorithm = validate_algorithm(&header.alg, &self.algorithms)?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::malformed_token("header missing 'kid'"))?;
        validate_kid(kid)?;
        tracing::Span::current().record("kid", kid);

        let key = self.key_cache.resolve_key(kid).await?;
        if !key.can_verify(algorithm) {
            tracing::warn!(
                family = ?key.family(),
                alg = ?algorithm,
                "token algorithm does not match signing key"
            );
            return Err(AuthError::key_algorithm_mismatch(kid, format!("{algorithm:?}")));
        }

        let valid = crypto::verify(
            token.signature(),
            token.signing_input(),
            key.decoding_key(),
            algorithm,
        )
        .unwrap_or(false);
        if !valid {
            self.record_forgery_attempt();
            return Err(AuthError::invalid_signature());
        }

        let claims = token.claims()?;
        validate_claims(
            &claims,
            &ClaimExpectations {
                issuer: expected_issuer,
                audience: expected_audience,
                leeway: self.clock_skew,
            },
            now,
        )
        .inspect_err(|err| tracing::debug!(error = %err, "claim validation failed"))?;

        let identity = VerifiedIdentity::from_claims(claims, expected_audience)?;
        tracing::debug!(subject = %identity.subject, "assertion verified");
        Ok(identity)
    }

    fn record_forgery_attempt(&self) {
        self.signature_failures.fetch_add(1, Ordering::Relaxed);
        let report = self.forgery_log.lock().record(Instant::now());
        if let Some(suppressed) = report {
            tracing::warn!(
                suppressed,
                total = self.signature_failures(),
                "assertion signature verification failed, possible forgery"
            );
        }
    }
}

impl std::fmt::Debug for AssertionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssertionVerifier")
            .field("key_cache", &self.key_cache)
            .field("algorithms", &self.algorithms)
            .field("clock_skew", &self.clock_skew)
            .finish_non_exhaustive()
    }
}
