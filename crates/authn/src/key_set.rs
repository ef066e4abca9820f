//! Published signing-key sets.
//!
//! Issuers publish their verification keys in one of two JSON shapes:
//!
//! ```text
//! JSON Web Key Set         {"keys": [{"kid": "...", "kty": "EC", "crv": "P-256", ...}]}
//! PEM / certificate map    {"<kid>": "-----BEGIN PUBLIC KEY-----\n...", ...}
//! ```
//!
//! IAP serves the first at `https://www.gstatic.com/iap/verify/public_key-jwk`
//! and the second at `https://www.gstatic.com/iap/verify/public_key`.
//! [`SigningKeySet::from_json`] accepts either. Individual keys that cannot be
//! used for signature verification are skipped with a warning rather than
//! failing the whole document, so one malformed or encryption-only entry does
//! not take down verification for every other key.

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{AlgorithmParameters, EllipticCurve, Jwk, PublicKeyUse},
};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::error::AuthError;

/// Why a single published key was not usable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The entry has no `kid`.
    #[error("key has no kid")]
    MissingKid,

    /// The entry is a symmetric key or another type that cannot verify signatures.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// The entry declares `"use": "enc"` or an encryption algorithm.
    #[error("key is not a signing key")]
    NotSigningKey,

    /// The key material could not be decoded.
    #[error("invalid key material: {0}")]
    InvalidMaterial(#[from] jsonwebtoken::errors::Error),

    /// The JWK JSON did not match any known key shape.
    #[error("invalid JWK: {0}")]
    InvalidJwk(#[from] serde_json::Error),
}

/// NIST curve of an ECDSA key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    /// P-256, used with ES256.
    P256,
    /// P-384, used with ES384.
    P384,
    /// P-521. Published by some issuers; no supported algorithm uses it.
    P521,
}

/// The public-key family, which determines the algorithms a key can verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// ECDSA key. `None` when the curve is not known (PEM without inspection).
    EllipticCurve(Option<EcCurve>),
    /// RSA key (PKCS#1 v1.5 or PSS).
    Rsa,
    /// Ed25519 key.
    Edwards,
}

impl KeyFamily {
    /// Returns `true` if a key of this family can verify `alg`.
    #[must_use]
    pub fn supports(self, alg: Algorithm) -> bool {
        match self {
            KeyFamily::EllipticCurve(None) => matches!(alg, Algorithm::ES256 | Algorithm::ES384),
            KeyFamily::EllipticCurve(Some(EcCurve::P256)) => alg == Algorithm::ES256,
            KeyFamily::EllipticCurve(Some(EcCurve::P384)) => alg == Algorithm::ES384,
            KeyFamily::EllipticCurve(Some(EcCurve::P521)) => false,
            KeyFamily::Rsa => matches!(
                alg,
                Algorithm::RS256
                    | Algorithm::RS384
                    | Algorithm::RS512
                    | Algorithm::PS256
                    | Algorithm::PS384
                    | Algorithm::PS512
            ),
            KeyFamily::Edwards => alg == Algorithm::EdDSA,
        }
    }
}

/// A single verification key from a published key set.
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    family: KeyFamily,
    algorithm: Option<Algorithm>,
    decoding_key: DecodingKey,
}

impl VerificationKey {
    /// Build a key from a parsed JWK.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the JWK has no `kid`, is symmetric or
    /// encryption-only, or its key material is invalid.
    pub fn from_jwk(jwk: &Jwk) -> Result<Self, KeyError> {
        let kid =
            jwk.common.key_id.clone().filter(|kid| !kid.is_empty()).ok_or(KeyError::MissingKid)?;

        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return Err(KeyError::NotSigningKey);
        }

        // KeyAlgorithm also covers encryption algorithms; only signing ones map onto Algorithm.
        let algorithm = match &jwk.common.key_algorithm {
            Some(key_alg) => Some(
                Algorithm::from_str(&format!("{key_alg:?}")).map_err(|_| KeyError::NotSigningKey)?,
            ),
            None => None,
        };

        let family = match &jwk.algorithm {
            AlgorithmParameters::EllipticCurve(params) => {
                let curve = match params.curve {
                    EllipticCurve::P256 => EcCurve::P256,
                    EllipticCurve::P384 => EcCurve::P384,
                    EllipticCurve::P521 => EcCurve::P521,
                    EllipticCurve::Ed25519 => {
                        return Err(KeyError::UnsupportedKeyType("EC with Ed25519 curve".into()));
                    },
                };
                KeyFamily::EllipticCurve(Some(curve))
            },
            AlgorithmParameters::RSA(_) => KeyFamily::Rsa,
            AlgorithmParameters::OctetKeyPair(params) if params.curve == EllipticCurve::Ed25519 => {
                KeyFamily::Edwards
            },
            AlgorithmParameters::OctetKeyPair(_) => {
                return Err(KeyError::UnsupportedKeyType("OKP with non-Ed25519 curve".into()));
            },
            AlgorithmParameters::OctetKey(_) => {
                return Err(KeyError::UnsupportedKeyType("oct".into()));
            },
        };

        if let Some(alg) = algorithm
            && !family.supports(alg)
        {
            return Err(KeyError::UnsupportedKeyType(format!("{family:?} key declared for {alg:?}")));
        }

        let decoding_key = DecodingKey::from_jwk(jwk)?;
        Ok(Self { kid, family, algorithm, decoding_key })
    }

    /// Build a key from a PEM-encoded public key or X.509 certificate.
    ///
    /// EC, RSA and Ed25519 keys are tried in that order.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidMaterial`] if the PEM is not a supported
    /// public key or certificate.
    pub fn from_pem(kid: impl Into<String>, pem: &str) -> Result<Self, KeyError> {
        let kid = kid.into();
        if kid.is_empty() {
            return Err(KeyError::MissingKid);
        }
        let pem = pem.as_bytes();

        let (family, decoding_key) = match DecodingKey::from_ec_pem(pem) {
            Ok(key) => (KeyFamily::EllipticCurve(None), key),
            Err(_) => match DecodingKey::from_rsa_pem(pem) {
                Ok(key) => (KeyFamily::Rsa, key),
                Err(_) => (KeyFamily::Edwards, DecodingKey::from_ed_pem(pem)?),
            },
        };

        Ok(Self { kid, family, algorithm: None, decoding_key })
    }

    /// The key ID.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The key family.
    #[must_use]
    pub fn family(&self) -> KeyFamily {
        self.family
    }

    /// The algorithm the publisher pinned this key to, if any.
    #[must_use]
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    /// Returns `true` if this key may verify a token declaring `alg`.
    #[must_use]
    pub fn can_verify(&self, alg: Algorithm) -> bool {
        self.family.supports(alg) && self.algorithm.is_none_or(|pinned| pinned == alg)
    }

    /// The key material for the signature primitive.
    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// An immutable snapshot of an issuer's published keys.
///
/// Replaced wholesale on refresh; never mutated after construction.
#[derive(Debug, Clone)]
pub struct SigningKeySet {
    keys: HashMap<String, Arc<VerificationKey>>,
    fetched_at: Instant,
}

impl SigningKeySet {
    /// Build a set from already-parsed keys, stamped with the current instant.
    ///
    /// If two keys share a `kid`, the first one wins.
    pub fn from_keys(keys: impl IntoIterator<Item = VerificationKey>) -> Self {
        let mut map = HashMap::new();
        for key in keys {
            if map.contains_key(key.kid()) {
                tracing::warn!(kid = key.kid(), "duplicate kid in key set, keeping first");
                continue;
            }
            map.insert(key.kid.clone(), Arc::new(key));
        }
        Self { keys: map, fetched_at: Instant::now() }
    }

    /// Parse a published key-set document.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeySetUnavailable`] if the document is not JSON,
    /// has neither shape, or contains no usable keys.
    pub fn from_json(document: &[u8]) -> Result<Self, AuthError> {
        let value: Value = serde_json::from_slice(document).map_err(|e| {
            AuthError::key_set_unavailable_with_source("key set document is not valid JSON", e)
        })?;

        let Value::Object(map) = value else {
            return Err(AuthError::key_set_unavailable("key set document must be a JSON object"));
        };

        let set = match map.get("keys") {
            Some(Value::Array(entries)) => Self::from_keys(entries.iter().filter_map(parse_jwk_entry)),
            Some(_) => {
                return Err(AuthError::key_set_unavailable("key set 'keys' member must be an array"));
            },
            None => Self::from_keys(map.iter().filter_map(|(kid, pem)| parse_pem_entry(kid, pem))),
        };

        if set.is_empty() {
            return Err(AuthError::key_set_unavailable("key set contains no usable keys"));
        }

        Ok(set)
    }

    /// Look up a key by ID.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.keys.get(kid).cloned()
    }

    /// Number of keys in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if the set has no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Iterate over the key IDs in the set.
    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// When the set was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    /// Time since the set was fetched.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }
}

fn parse_jwk_entry(entry: &Value) -> Option<VerificationKey> {
    let kid = entry.get("kid").and_then(Value::as_str).unwrap_or("<none>");
    let result = serde_json::from_value::<Jwk>(entry.clone())
        .map_err(KeyError::from)
        .and_then(|jwk| VerificationKey::from_jwk(&jwk));
    match result {
        Ok(key) => Some(key),
        Err(err) => {
            tracing::warn!(kid, error = %err, "skipping unusable key in JWKS");
            None
        },
    }
}

fn parse_pem_entry(kid: &str, pem: &Value) -> Option<VerificationKey> {
    let Some(pem) = pem.as_str() else {
        tracing::warn!(kid, "skipping non-string entry in PEM key map");
        return None;
    };
    match VerificationKey::from_pem(kid, pem) {
        Ok(key) => Some(key),
        Err(err) => {
            tracing::warn!(kid, error = %err, "skipping unusable key in PEM key map");
            None
        },
    }
}
