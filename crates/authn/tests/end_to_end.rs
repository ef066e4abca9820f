//! End-to-end verification against a fake key-set endpoint.
//!
//! Each test serves a key set from a [`wiremock`] server and drives the full
//! path: HTTP fetch, key-set parsing, caching, signature and claim checks.
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use http::{HeaderMap, HeaderValue};
use iap_authn::{
    AssertionVerifier, HttpKeySetSource, IAP_ASSERTION_HEADER, IapAuthenticator, IapConfig,
    KeySetCache, assert_auth_error,
    testutil::{
        TEST_AUDIENCE, TEST_ISSUER, TestSigningKey, certificate_map_document,
        create_signed_assertion, iap_claims, jwks_document, pem_map_document,
    },
};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

const JWK_PATH: &str = "/iap/verify/public_key-jwk";

async fn serve(document: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(document))
        .mount(&server)
        .await;
    server
}

fn verifier_for(server: &MockServer, fetch_timeout: Duration) -> AssertionVerifier {
    let source =
        HttpKeySetSource::new(format!("{}{JWK_PATH}", server.uri()), fetch_timeout).unwrap();
    let cache = KeySetCache::new(Arc::new(source), Duration::from_secs(300))
        .with_fetch_timeout(fetch_timeout);
    AssertionVerifier::new(Arc::new(cache))
}

// ===========================================================================
// Successful verification
// ===========================================================================

#[tokio::test]
async fn test_verify_returns_exact_identity_from_payload() {
    let key = TestSigningKey::es256("iap-key-1");
    let server = serve(jwks_document(&[&key])).await;
    let verifier = verifier_for(&server, Duration::from_secs(2));

    let token = key.sign(&iap_claims("alice@corp.example", "accounts.google.com:42", TEST_AUDIENCE));
    let identity = verifier.verify(&token, TEST_AUDIENCE, TEST_ISSUER).await.unwrap();

    assert_eq!(identity.email, "alice@corp.example");
    assert_eq!(identity.subject, "accounts.google.com:42");
    assert_eq!(identity.issuer, "https://cloud.google.com/iap");
    assert_eq!(identity.audience, "/projects/123/apps/demo");
    assert_eq!(identity.hosted_domain.as_deref(), Some("corp.example"));
}

#[tokio::test]
async fn test_pem_map_document_verifies() {
    let key = TestSigningKey::es256("pem-key");
    let server = serve(pem_map_document(&[&key])).await;
    let verifier = verifier_for(&server, Duration::from_secs(2));

    let identity =
        verifier.verify(&create_signed_assertion(&key), TEST_AUDIENCE, TEST_ISSUER).await.unwrap();
    assert_eq!(identity.email, "user@example.com");
}

#[tokio::test]
async fn test_certificate_map_document_verifies() {
    let key = TestSigningKey::es256("cert-key");
    let server = serve(certificate_map_document(&[&key])).await;
    let verifier = verifier_for(&server, Duration::from_secs(2));

    let identity =
        verifier.verify(&create_signed_assertion(&key), TEST_AUDIENCE, TEST_ISSUER).await.unwrap();
    assert_eq!(identity.subject, "accounts.google.com:1234567890");
}

#[tokio::test]
async fn test_repeated_verification_fetches_once() {
    let key = TestSigningKey::es256("iap-key-1");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(JWK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_document(&[&key])))
        .expect(1)
        .mount(&server)
        .await;
    let verifier = verifier_for(&server, Duration::from_secs(2));

    let token = create_signed_assertion(&key);
    for _ in 0..5 {
        verifier.verify(&token, TEST_AUDIENCE, TEST_ISSUER).await.unwrap();
    }
    // `expect(1)` is checked when the server drops
}

// ===========================================================================
// Endpoint failures
// ===========================================================================

#[tokio::test]
async fn test_http_500_without_cache_is_key_set_unavailable_within_timeout() {
    let key = TestSigningKey::es256("iap-key-1");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let fetch_timeout = Duration::from_secs(1);
    let verifier = verifier_for(&server, fetch_timeout);

    let started = std::time::Instant::now();
    let result = verifier.verify(&create_signed_assertion(&key), TEST_AUDIENCE, TEST_ISSUER).await;

    assert_auth_error!(result, KeySetUnavailable);
    assert!(started.elapsed() <= fetch_timeout + Duration::from_millis(500));
}

#[tokio::test]
async fn test_hanging_endpoint_is_bounded_by_fetch_timeout() {
    let key = TestSigningKey::es256("iap-key-1");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(jwks_document(&[&key]))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let fetch_timeout = Duration::from_millis(300);
    let verifier = verifier_for(&server, fetch_timeout);

    let started = std::time::Instant::now();
    let result = verifier.verify(&create_signed_assertion(&key), TEST_AUDIENCE, TEST_ISSUER).await;

    assert_auth_error!(result, KeySetUnavailable);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_outage_after_fetch_serves_cached_keys() {
    let key = TestSigningKey::es256("iap-key-1");
    let server = serve(jwks_document(&[&key])).await;
    let source =
        HttpKeySetSource::new(format!("{}{JWK_PATH}", server.uri()), Duration::from_secs(1))
            .unwrap();
    let cache = Arc::new(
        KeySetCache::new(Arc::new(source), Duration::from_millis(50))
            .with_stale_grace(Duration::from_secs(3_600)),
    );
    let verifier = AssertionVerifier::new(cache.clone());

    let token = create_signed_assertion(&key);
    verifier.verify(&token, TEST_AUDIENCE, TEST_ISSUER).await.unwrap();

    // Endpoint goes down and the TTL lapses
    server.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    verifier.verify(&token, TEST_AUDIENCE, TEST_ISSUER).await.unwrap();
    assert_eq!(cache.metrics().stale_served, 1);
}

// ===========================================================================
// Request authentication
// ===========================================================================

#[tokio::test]
async fn test_authenticator_from_config() {
    let key = TestSigningKey::es256("iap-key-1");
    let server = serve(jwks_document(&[&key])).await;

    let config = IapConfig::builder()
        .audience(TEST_AUDIENCE)
        .key_set_url(format!("{}{JWK_PATH}", server.uri()))
        .fetch_timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let authenticator = IapAuthenticator::new(&config).unwrap();

    let mut headers = HeaderMap::new();
    headers.insert(
        IAP_ASSERTION_HEADER,
        HeaderValue::from_str(&create_signed_assertion(&key)).unwrap(),
    );
    let identity = authenticator.authenticate(&headers).await.unwrap().expect("identity");
    assert_eq!(identity.email, "user@example.com");

    assert!(authenticator.authenticate(&HeaderMap::new()).await.unwrap().is_none());
    authenticator.shutdown().await;
}
