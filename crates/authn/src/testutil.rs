//! Shared test utilities for assertion verification.
//!
//! This module provides helpers for generating ES256 and Ed25519 signing
//! keys, publishing them as JWKS, PEM or certificate maps, minting signed
//! IAP-style assertions, crafting raw tokens for attack testing, and an
//! in-memory [`KeySetSource`]. It is feature-gated behind `testutil` to
//! prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! iap-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use iap_authn::testutil::{TestSigningKey, create_signed_assertion, jwks_document};
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::Utc;
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use rand_core::OsRng;
use serde_json::{Value, json};
use tokio::sync::Notify;
use zeroize::Zeroizing;

use crate::{error::AuthError, key_set::SigningKeySet, key_source::KeySetSource};

/// Issuer used by IAP.
pub const TEST_ISSUER: &str = "https://cloud.google.com/iap";

/// Audience format used by IAP for App Engine and backend services.
pub const TEST_AUDIENCE: &str = "/projects/123/apps/demo";

/// Generates a test Ed25519 key pair.
///
/// Returns `(pkcs8_der, public_key_base64url)` where:
/// - `pkcs8_der` is the private key in PKCS#8 DER format wrapped in [`Zeroizing`] (suitable for
///   [`EncodingKey::from_ed_der`])
/// - `public_key_base64url` is the 32-byte public key encoded as base64url without padding (the
///   JWK `x` parameter)
///
/// Each call generates a fresh random key pair.
pub fn generate_test_keypair() -> (Zeroizing<Vec<u8>>, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());

    let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
    let mut pkcs8_der = Zeroizing::new(vec![
        0x30, 0x2e, // SEQUENCE, 46 bytes
        0x02, 0x01, 0x00, // INTEGER version 0
        0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
        0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
        0x04, 0x22, // OCTET STRING, 34 bytes
        0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
    ]);
    pkcs8_der.extend_from_slice(&*private_bytes);

    (pkcs8_der, public_key_b64)
}

/// Wraps a raw Ed25519 public key in SubjectPublicKeyInfo PEM.
fn ed25519_public_key_pem(public_key: &[u8]) -> String {
    let mut spki = vec![
        0x30, 0x2a, // SEQUENCE, 42 bytes
        0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
        0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
        0x03, 0x21, 0x00, // BIT STRING, 33 bytes, no unused bits
    ];
    spki.extend_from_slice(public_key);
    format!("-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n", STANDARD.encode(spki))
}

/// A signing key with everything needed to publish and use it in tests.
pub struct TestSigningKey {
    kid: String,
    algorithm: Algorithm,
    pkcs8_der: Zeroizing<Vec<u8>>,
    jwk: Value,
    public_key_pem: String,
    /// Retained so a certificate can be issued for the same key.
    ec_key_pair: Option<rcgen::KeyPair>,
}

impl TestSigningKey {
    /// Generates a fresh P-256 key for ES256, the algorithm IAP signs with.
    ///
    /// # Panics
    ///
    /// Panics if key generation fails.
    pub fn es256(kid: &str) -> Self {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .expect("P-256 key generation");
        // Uncompressed SEC1 point: 0x04 || x (32 bytes) || y (32 bytes)
        let point = key_pair.public_key_raw();
        assert_eq!(point.len(), 65, "unexpected P-256 public key encoding");
        let jwk = json!({
            "kty": "EC",
            "crv": "P-256",
            "alg": "ES256",
            "use": "sig",
            "kid": kid,
            "x": URL_SAFE_NO_PAD.encode(&point[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&point[33..65]),
        });

        Self {
            kid: kid.to_string(),
            algorithm: Algorithm::ES256,
            pkcs8_der: Zeroizing::new(key_pair.serialize_der()),
            jwk,
            public_key_pem: key_pair.public_key_pem(),
            ec_key_pair: Some(key_pair),
        }
    }

    /// Generates a fresh Ed25519 key for EdDSA.
    pub fn ed25519(kid: &str) -> Self {
        let (pkcs8_der, public_key_b64) = generate_test_keypair();
        let public_key = URL_SAFE_NO_PAD.decode(&public_key_b64).expect("base64url public key");
        let jwk = json!({
            "kty": "OKP",
            "crv": "Ed25519",
            "alg": "EdDSA",
            "use": "sig",
            "kid": kid,
            "x": public_key_b64,
        });

        Self {
            kid: kid.to_string(),
            algorithm: Algorithm::EdDSA,
            pkcs8_der,
            jwk,
            public_key_pem: ed25519_public_key_pem(&public_key),
            ec_key_pair: None,
        }
    }

    /// The key ID.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The algorithm tokens signed by this key declare.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The public key as a JWK.
    pub fn jwk(&self) -> Value {
        self.jwk.clone()
    }

    /// The public key as SubjectPublicKeyInfo PEM.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// A self-signed X.509 certificate for this key, in PEM.
    ///
    /// # Panics
    ///
    /// Panics for Ed25519 keys or if certificate generation fails.
    pub fn certificate_pem(&self) -> String {
        let key_pair = self.ec_key_pair.as_ref().expect("certificates are only issued for EC keys");
        let params = rcgen::CertificateParams::new(vec!["iap-test.example.com".to_string()])
            .expect("certificate params");
        params.self_signed(key_pair).expect("self-signed certificate").pem()
    }

    /// The private key encoder.
    pub fn encoding_key(&self) -> EncodingKey {
        match self.algorithm {
            Algorithm::EdDSA => EncodingKey::from_ed_der(&self.pkcs8_der),
            _ => EncodingKey::from_ec_der(&self.pkcs8_der),
        }
    }

    /// Signs `claims` with a header carrying this key's `alg` and `kid`.
    ///
    /// # Panics
    ///
    /// Panics if JWT encoding fails (should not happen with valid inputs).
    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());
        self.sign_with_header(&header, claims)
    }

    /// Signs `claims` with an explicit header.
    ///
    /// # Panics
    ///
    /// Panics if JWT encoding fails.
    pub fn sign_with_header(&self, header: &Header, claims: &Value) -> String {
        jsonwebtoken::encode(header, claims, &self.encoding_key()).expect("Failed to encode test JWT")
    }
}

/// Builds a JSON Web Key Set document.
pub fn jwks_document(keys: &[&TestSigningKey]) -> Value {
    json!({ "keys": keys.iter().map(|key| key.jwk()).collect::<Vec<_>>() })
}

/// Builds a kid to PEM public key map, the shape of IAP's legacy endpoint.
pub fn pem_map_document(keys: &[&TestSigningKey]) -> Value {
    Value::Object(
        keys.iter().map(|key| (key.kid.clone(), Value::String(key.public_key_pem.clone()))).collect(),
    )
}

/// Builds a kid to X.509 certificate PEM map.
///
/// # Panics
///
/// Panics if any key is not an EC key.
pub fn certificate_map_document(keys: &[&TestSigningKey]) -> Value {
    Value::Object(
        keys.iter().map(|key| (key.kid.clone(), Value::String(key.certificate_pem()))).collect(),
    )
}

/// IAP-shaped claims valid for the next 5 minutes.
pub fn iap_claims(email: &str, subject: &str, audience: &str) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "iss": TEST_ISSUER,
        "aud": audience,
        "sub": subject,
        "email": email,
        "hd": email.rsplit_once('@').map(|(_, domain)| domain),
        "iat": now,
        "exp": now + 300,
    })
}

/// Creates a valid assertion for [`TEST_AUDIENCE`], signed by `key`.
///
/// The subject is `accounts.google.com:1234567890` and the email is
/// `user@example.com`. The token expires in 5 minutes.
pub fn create_signed_assertion(key: &TestSigningKey) -> String {
    key.sign(&iap_claims("user@example.com", "accounts.google.com:1234567890", TEST_AUDIENCE))
}

/// Creates a raw JWT string from arbitrary header and payload JSON.
///
/// The resulting JWT has the structure `{header_b64}.{payload_b64}.`
/// with an empty signature. This is useful for testing rejection of
/// malformed or attack JWTs (e.g., `alg: "none"`, algorithm confusion).
///
/// # Panics
///
/// Panics if JSON serialization fails.
pub fn craft_raw_jwt(header_json: &Value, payload_json: &Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}

/// Flips one bit in the decoded signature of a compact token.
///
/// # Panics
///
/// Panics if the token has no signature segment or it is not base64url.
pub fn flip_signature_bit(token: &str, bit: usize) -> String {
    let (signing_input, signature) = token.rsplit_once('.').expect("compact token");
    let mut bytes = URL_SAFE_NO_PAD.decode(signature).expect("base64url signature");
    assert!(!bytes.is_empty(), "cannot tamper with an empty signature");
    let bit = bit % (bytes.len() * 8);
    bytes[bit / 8] ^= 1 << (bit % 8);
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// In-memory [`KeySetSource`] serving a replaceable JSON document.
///
/// Counts fetches and can be told to fail, delay, or block the next fetch
/// until [`release`](Self::release) is called. Used to test single-flight
/// refresh and stale fallback in the key-set cache.
pub struct StaticKeySetSource {
    document: Mutex<Value>,
    fetches: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Duration>,
    /// When set, the next fetch signals `started` and waits on `gate`.
    gate_enabled: AtomicBool,
    started: Notify,
    gate: Notify,
}

impl StaticKeySetSource {
    /// Creates a source serving `document`.
    pub fn new(document: Value) -> Self {
        Self {
            document: Mutex::new(document),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            gate_enabled: AtomicBool::new(false),
            started: Notify::new(),
            gate: Notify::new(),
        }
    }

    /// Replaces the served document, simulating key rotation.
    pub fn set_document(&self, document: Value) {
        *self.document.lock() = document;
    }

    /// Makes subsequent fetches fail (or succeed again).
    pub fn set_failure(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every fetch by `delay` (tokio time).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Blocks the next fetch until [`release`](Self::release).
    pub fn enable_gate(&self) {
        self.gate_enabled.store(true, Ordering::SeqCst);
    }

    /// Waits until a gated fetch has started.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    /// Lets a gated fetch proceed.
    pub fn release(&self) {
        self.gate.notify_one();
    }

    /// Number of fetches issued so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySetSource for StaticKeySetSource {
    fn endpoint(&self) -> &str {
        "static://keys"
    }

    async fn fetch(&self) -> Result<SigningKeySet, AuthError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.gate_enabled.swap(false, Ordering::SeqCst) {
            self.started.notify_one();
            self.gate.notified().await;
        }

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthError::key_set_unavailable("static source configured to fail"));
        }

        let document = self.document.lock().to_string();
        SigningKeySet::from_json(document.as_bytes())
    }
}

/// Convenience for wiring a [`StaticKeySetSource`] into a cache.
pub fn static_source(keys: &[&TestSigningKey]) -> Arc<StaticKeySetSource> {
    Arc::new(StaticKeySetSource::new(jwks_document(keys)))
}

/// Asserts that a [`Result<T, AuthError>`] is an `Err` matching the given [`AuthError`] variant.
///
/// Works with any `AuthError` variant. On failure, prints the expected variant
/// and the actual result for debugging.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use iap_authn::assert_auth_error;
/// use iap_authn::error::AuthError;
///
/// let result: Result<(), AuthError> = Err(AuthError::invalid_signature());
/// assert_auth_error!(result, InvalidSignature);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_test_keypair_produces_valid_key() {
        let (pkcs8_der, public_key_b64) = generate_test_keypair();
        // PKCS#8 DER for Ed25519 is 48 bytes (16 header + 32 key)
        assert_eq!(pkcs8_der.len(), 48);
        // Base64url of 32 bytes = 43 characters (no padding)
        assert_eq!(public_key_b64.len(), 43);
    }

    #[test]
    fn test_es256_key_publishes_p256_jwk() {
        let key = TestSigningKey::es256("kid-001");
        let jwk = key.jwk();
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
        assert_eq!(jwk["kid"], "kid-001");
        // 32-byte coordinates are 43 base64url characters
        assert_eq!(jwk["x"].as_str().unwrap().len(), 43);
        assert_eq!(jwk["y"].as_str().unwrap().len(), 43);
        assert!(key.public_key_pem().starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_keys_are_unique() {
        let a = TestSigningKey::es256("a");
        let b = TestSigningKey::es256("b");
        assert_ne!(a.jwk()["x"], b.jwk()["x"], "each call should produce a unique key pair");
    }

    #[test]
    fn test_certificate_pem() {
        let key = TestSigningKey::es256("cert");
        assert!(key.certificate_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_create_signed_assertion_produces_three_part_token() {
        let key = TestSigningKey::es256("kid-001");
        let jwt = create_signed_assertion(&key);
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3, "JWT should have header.payload.signature");
        assert!(!parts[2].is_empty(), "signature should not be empty");
    }

    #[test]
    fn test_iap_claims_derives_hosted_domain() {
        let claims = iap_claims("alice@corp.example", "sub", TEST_AUDIENCE);
        assert_eq!(claims["hd"], "corp.example");
        assert_eq!(claims["iss"], TEST_ISSUER);
    }

    #[test]
    fn test_craft_raw_jwt_format() {
        let header = json!({"alg": "none", "typ": "JWT"});
        let payload = json!({"sub": "test"});
        let jwt = craft_raw_jwt(&header, &payload);
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].is_empty(), "signature should be empty for raw JWTs");
    }

    #[test]
    fn test_flip_signature_bit_changes_only_signature() {
        let key = TestSigningKey::es256("k");
        let token = create_signed_assertion(&key);
        let tampered = flip_signature_bit(&token, 3);
        assert_ne!(token, tampered);
        assert_eq!(token.rsplit_once('.').unwrap().0, tampered.rsplit_once('.').unwrap().0);
    }

    #[tokio::test]
    async fn test_static_source_counts_and_fails() {
        let key = TestSigningKey::es256("k");
        let source = static_source(&[&key]);
        assert!(source.fetch().await.is_ok());
        source.set_failure(true);
        assert_auth_error!(source.fetch().await, KeySetUnavailable);
        assert_eq!(source.fetch_count(), 2);
    }

    #[test]
    fn test_assert_auth_error_with_message() {
        let result: Result<(), AuthError> = Err(AuthError::unknown_signing_key("kid-001"));
        assert_auth_error!(result, UnknownSigningKey, "kid should be unknown");
    }
}
