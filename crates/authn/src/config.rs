//! Configuration for IAP assertion verification.
//!
//! [`IapConfig`] can be built in code, deserialized (durations in
//! `humantime` syntax such as `"5m"`), or read from `IAP_*` environment
//! variables.

use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::{
    error::AuthError,
    key_set_cache::{DEFAULT_FETCH_TIMEOUT, DEFAULT_KEY_SET_TTL, DEFAULT_STALE_GRACE},
    key_source::IAP_JWK_URL,
    validation::ACCEPTED_ALGORITHMS,
    verifier::DEFAULT_CLOCK_SKEW,
};

/// Issuer of every IAP assertion.
pub const IAP_ISSUER: &str = "https://cloud.google.com/iap";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required field is empty.
    #[error("{field} cannot be empty")]
    Empty {
        /// Field name.
        field: &'static str,
    },

    /// A duration that must be positive is zero.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Field name.
        field: &'static str,
    },

    /// An algorithm outside the supported asymmetric set was configured.
    #[error("algorithm {alg} is not supported for IAP assertions")]
    UnsupportedAlgorithm {
        /// The rejected algorithm.
        alg: String,
    },

    /// A required environment variable is not set.
    #[error("missing environment variable: {0}")]
    MissingVar(&'static str),

    /// An environment variable could not be parsed.
    #[error("invalid value for {var}: {message}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Parse failure.
        message: String,
    },

    /// The key-set source could not be constructed.
    #[error("failed to construct key set source: {0}")]
    KeySource(#[from] AuthError),
}

/// Settings for verifying IAP assertions.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use iap_authn::IapConfig;
///
/// let config = IapConfig::builder()
///     .audience("/projects/123/apps/demo")
///     .key_set_ttl(Duration::from_secs(600))
///     .build()?;
///
/// assert_eq!(config.issuer(), "https://cloud.google.com/iap");
/// # Ok::<(), iap_authn::config::ConfigError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IapConfig {
    /// Expected `aud`: `/projects/{number}/apps/{id}` or
    /// `/projects/{number}/global/backendServices/{id}`.
    pub(crate) audience: String,

    /// Expected `iss`.
    #[serde(default = "default_issuer")]
    pub(crate) issuer: String,

    /// Key-set endpoint.
    #[serde(default = "default_key_set_url")]
    pub(crate) key_set_url: String,

    /// How long a fetched set is fresh.
    #[serde(with = "humantime_serde", default = "default_key_set_ttl")]
    pub(crate) key_set_ttl: Duration,

    /// How long past TTL a set may be served while the endpoint fails.
    #[serde(with = "humantime_serde", default = "default_stale_grace")]
    pub(crate) stale_grace: Duration,

    /// Tolerance applied to time claims.
    #[serde(with = "humantime_serde", default = "default_clock_skew")]
    pub(crate) clock_skew: Duration,

    /// Upper bound on a single key-set fetch.
    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    pub(crate) fetch_timeout: Duration,

    /// Accepted signature algorithms.
    #[serde(default = "default_algorithms")]
    pub(crate) algorithms: Vec<Algorithm>,

    /// Proactive background refresh period, if any.
    #[serde(with = "humantime_serde", default)]
    pub(crate) refresh_interval: Option<Duration>,
}

fn default_issuer() -> String {
    IAP_ISSUER.to_string()
}

fn default_key_set_url() -> String {
    IAP_JWK_URL.to_string()
}

fn default_key_set_ttl() -> Duration {
    DEFAULT_KEY_SET_TTL
}

fn default_stale_grace() -> Duration {
    DEFAULT_STALE_GRACE
}

fn default_clock_skew() -> Duration {
    DEFAULT_CLOCK_SKEW
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::ES256]
}

#[bon::bon]
impl IapConfig {
    /// Creates a new configuration, validating all fields.
    ///
    /// # Arguments
    ///
    /// * `audience` - Expected audience. Required.
    ///
    /// # Optional Fields
    ///
    /// * `issuer` - Expected issuer (default: `https://cloud.google.com/iap`).
    /// * `key_set_url` - Key-set endpoint (default: IAP's JWKS endpoint).
    /// * `key_set_ttl` - Key-set freshness (default: 5 minutes).
    /// * `stale_grace` - Outage grace past TTL (default: 1 hour).
    /// * `clock_skew` - Time-claim tolerance (default: 5 seconds).
    /// * `fetch_timeout` - Per-fetch bound (default: 5 seconds).
    /// * `algorithms` - Accepted algorithms (default: ES256).
    /// * `refresh_interval` - Background refresh period (default: none).
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (see [`validate`](Self::validate)).
    #[builder]
    pub fn new(
        #[builder(into)] audience: String,
        #[builder(into, default = default_issuer())] issuer: String,
        #[builder(into, default = default_key_set_url())] key_set_url: String,
        #[builder(default = DEFAULT_KEY_SET_TTL)] key_set_ttl: Duration,
        #[builder(default = DEFAULT_STALE_GRACE)] stale_grace: Duration,
        #[builder(default = DEFAULT_CLOCK_SKEW)] clock_skew: Duration,
        #[builder(default = DEFAULT_FETCH_TIMEOUT)] fetch_timeout: Duration,
        #[builder(into, default = default_algorithms())] algorithms: Vec<Algorithm>,
        refresh_interval: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            audience,
            issuer,
            key_set_url,
            key_set_ttl,
            stale_grace,
            clock_skew,
            fetch_timeout,
            algorithms,
            refresh_interval,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads the configuration from `IAP_*` environment variables.
    ///
    /// `IAP_AUDIENCE` is required. `IAP_ISSUER`, `IAP_KEY_SET_URL`,
    /// `IAP_KEY_SET_TTL`, `IAP_STALE_GRACE`, `IAP_CLOCK_SKEW`,
    /// `IAP_FETCH_TIMEOUT` and `IAP_REFRESH_INTERVAL` override the defaults;
    /// durations use `humantime` syntax (`30s`, `5m`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingVar`] without an audience,
    /// [`ConfigError::InvalidValue`] for unparseable durations, or any
    /// validation error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let duration = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(var) {
                Some(value) => humantime::parse_duration(value.trim()).map_err(|e| {
                    ConfigError::InvalidValue { var, message: e.to_string() }
                }),
                None => Ok(default),
            }
        };

        let refresh_interval = match lookup("IAP_REFRESH_INTERVAL") {
            Some(value) => Some(humantime::parse_duration(value.trim()).map_err(|e| {
                ConfigError::InvalidValue { var: "IAP_REFRESH_INTERVAL", message: e.to_string() }
            })?),
            None => None,
        };

        Self::builder()
            .audience(lookup("IAP_AUDIENCE").ok_or(ConfigError::MissingVar("IAP_AUDIENCE"))?)
            .issuer(lookup("IAP_ISSUER").unwrap_or_else(default_issuer))
            .key_set_url(lookup("IAP_KEY_SET_URL").unwrap_or_else(default_key_set_url))
            .key_set_ttl(duration("IAP_KEY_SET_TTL", DEFAULT_KEY_SET_TTL)?)
            .stale_grace(duration("IAP_STALE_GRACE", DEFAULT_STALE_GRACE)?)
            .clock_skew(duration("IAP_CLOCK_SKEW", DEFAULT_CLOCK_SKEW)?)
            .fetch_timeout(duration("IAP_FETCH_TIMEOUT", DEFAULT_FETCH_TIMEOUT)?)
            .maybe_refresh_interval(refresh_interval)
            .build()
    }

    /// Checks the invariants the builder enforces. Call this after
    /// deserializing.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Audience, issuer or key-set URL is empty
    /// - Key-set TTL, fetch timeout or refresh interval is zero
    /// - The algorithm list is empty or contains an unsupported algorithm
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("audience", &self.audience),
            ("issuer", &self.issuer),
            ("key_set_url", &self.key_set_url),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Empty { field });
            }
        }

        if self.key_set_ttl.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "key_set_ttl" });
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration { field: "fetch_timeout" });
        }
        if self.refresh_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(ConfigError::ZeroDuration { field: "refresh_interval" });
        }

        if self.algorithms.is_empty() {
            return Err(ConfigError::Empty { field: "algorithms" });
        }
        if let Some(alg) = self.algorithms.iter().find(|alg| !ACCEPTED_ALGORITHMS.contains(alg)) {
            return Err(ConfigError::UnsupportedAlgorithm { alg: format!("{alg:?}") });
        }

        Ok(())
    }

    /// Returns the expected audience.
    #[must_use]
    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Returns the expected issuer.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the key-set endpoint.
    #[must_use]
    pub fn key_set_url(&self) -> &str {
        &self.key_set_url
    }

    /// Returns the key-set TTL.
    #[must_use]
    pub fn key_set_ttl(&self) -> Duration {
        self.key_set_ttl
    }

    /// Returns the stale grace.
    #[must_use]
    pub fn stale_grace(&self) -> Duration {
        self.stale_grace
    }

    /// Returns the clock skew.
    #[must_use]
    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    /// Returns the fetch timeout.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Returns the accepted algorithms.
    #[must_use]
    pub fn algorithms(&self) -> &[Algorithm] {
        &self.algorithms
    }

    /// Returns the background refresh period, if configured.
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    const AUDIENCE: &str = "/projects/123/apps/demo";

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |var: &str| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = IapConfig::builder().audience(AUDIENCE).build().unwrap();

        assert_eq!(config.audience(), AUDIENCE);
        assert_eq!(config.issuer(), IAP_ISSUER);
        assert_eq!(config.key_set_url(), IAP_JWK_URL);
        assert_eq!(config.key_set_ttl(), Duration::from_secs(300));
        assert_eq!(config.stale_grace(), Duration::from_secs(3_600));
        assert_eq!(config.clock_skew(), Duration::from_secs(5));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(5));
        assert_eq!(config.algorithms(), &[Algorithm::ES256]);
        assert!(config.refresh_interval().is_none());
    }

    #[test]
    fn test_all_optional_fields() {
        let config = IapConfig::builder()
            .audience(AUDIENCE)
            .issuer("https://issuer.example")
            .key_set_url("https://keys.example/jwks")
            .key_set_ttl(Duration::from_secs(60))
            .stale_grace(Duration::from_secs(120))
            .clock_skew(Duration::from_secs(30))
            .fetch_timeout(Duration::from_secs(2))
            .algorithms(vec![Algorithm::ES256, Algorithm::RS256])
            .refresh_interval(Duration::from_secs(45))
            .build()
            .unwrap();

        assert_eq!(config.issuer(), "https://issuer.example");
        assert_eq!(config.algorithms(), &[Algorithm::ES256, Algorithm::RS256]);
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(45)));
    }

    #[rstest]
    #[case::empty_audience(IapConfig::builder().audience("").build(), "audience")]
    #[case::blank_issuer(IapConfig::builder().audience(AUDIENCE).issuer("  ").build(), "issuer")]
    #[case::empty_url(IapConfig::builder().audience(AUDIENCE).key_set_url("").build(), "key_set_url")]
    #[case::no_algorithms(
        IapConfig::builder().audience(AUDIENCE).algorithms(Vec::<Algorithm>::new()).build(),
        "algorithms"
    )]
    fn test_empty_fields_rejected(
        #[case] result: Result<IapConfig, ConfigError>,
        #[case] expected: &str,
    ) {
        match result {
            Err(ConfigError::Empty { field }) => assert_eq!(field, expected),
            other => panic!("expected Empty {{ {expected} }}, got {other:?}"),
        }
    }

    #[rstest]
    #[case::hs256(Algorithm::HS256)]
    #[case::hs512(Algorithm::HS512)]
    fn test_symmetric_algorithm_rejected(#[case] alg: Algorithm) {
        let result =
            IapConfig::builder().audience(AUDIENCE).algorithms(vec![Algorithm::ES256, alg]).build();
        assert!(matches!(result, Err(ConfigError::UnsupportedAlgorithm { .. })));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let ttl = IapConfig::builder().audience(AUDIENCE).key_set_ttl(Duration::ZERO).build();
        assert!(matches!(ttl, Err(ConfigError::ZeroDuration { field: "key_set_ttl" })));

        let refresh =
            IapConfig::builder().audience(AUDIENCE).refresh_interval(Duration::ZERO).build();
        assert!(matches!(refresh, Err(ConfigError::ZeroDuration { field: "refresh_interval" })));
    }

    #[test]
    fn test_deserialize_with_humantime_durations() {
        let config: IapConfig = serde_json::from_str(
            r#"{
                "audience": "/projects/123/apps/demo",
                "key_set_ttl": "10m",
                "stale_grace": "2h",
                "clock_skew": "30s",
                "algorithms": ["ES256", "EdDSA"]
            }"#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.key_set_ttl(), Duration::from_secs(600));
        assert_eq!(config.stale_grace(), Duration::from_secs(7_200));
        assert_eq!(config.clock_skew(), Duration::from_secs(30));
        assert_eq!(config.fetch_timeout(), DEFAULT_FETCH_TIMEOUT);
        assert_eq!(config.algorithms(), &[Algorithm::ES256, Algorithm::EdDSA]);
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result = serde_json::from_str::<IapConfig>(
            r#"{"audience": "/projects/123/apps/demo", "audiance": "typo"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let config = IapConfig::builder()
            .audience(AUDIENCE)
            .refresh_interval(Duration::from_secs(90))
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: IapConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = IapConfig::from_lookup(lookup_from(&[("IAP_AUDIENCE", AUDIENCE)])).unwrap();
        assert_eq!(config.audience(), AUDIENCE);
        assert_eq!(config.key_set_ttl(), DEFAULT_KEY_SET_TTL);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = IapConfig::from_lookup(lookup_from(&[
            ("IAP_AUDIENCE", AUDIENCE),
            ("IAP_ISSUER", "https://issuer.example"),
            ("IAP_KEY_SET_URL", "https://keys.example/jwks"),
            ("IAP_KEY_SET_TTL", "15m"),
            ("IAP_STALE_GRACE", "30m"),
            ("IAP_CLOCK_SKEW", "10s"),
            ("IAP_FETCH_TIMEOUT", "1500ms"),
            ("IAP_REFRESH_INTERVAL", "4m"),
        ]))
        .unwrap();

        assert_eq!(config.issuer(), "https://issuer.example");
        assert_eq!(config.key_set_url(), "https://keys.example/jwks");
        assert_eq!(config.key_set_ttl(), Duration::from_secs(900));
        assert_eq!(config.stale_grace(), Duration::from_secs(1_800));
        assert_eq!(config.clock_skew(), Duration::from_secs(10));
        assert_eq!(config.fetch_timeout(), Duration::from_millis(1_500));
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(240)));
    }

    #[test]
    fn test_from_lookup_missing_audience() {
        let result = IapConfig::from_lookup(lookup_from(&[]));
        assert!(matches!(result, Err(ConfigError::MissingVar("IAP_AUDIENCE"))));
    }

    #[test]
    fn test_from_lookup_invalid_duration() {
        let result = IapConfig::from_lookup(lookup_from(&[
            ("IAP_AUDIENCE", AUDIENCE),
            ("IAP_CLOCK_SKEW", "five seconds"),
        ]));
        match result {
            Err(ConfigError::InvalidValue { var, .. }) => assert_eq!(var, "IAP_CLOCK_SKEW"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }
}
