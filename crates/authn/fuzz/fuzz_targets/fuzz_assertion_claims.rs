//! Structured fuzz target for claim decoding and validation.
//!
//! Uses the `arbitrary` crate to generate structured assertion-like inputs,
//! assembles them into base64url tokens, and feeds them through parsing,
//! claim decoding and claim validation. This reaches deeper code paths than
//! raw byte fuzzing because the inputs have plausible structure.

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::DateTime;
use iap_authn::token::{AssertionToken, ClaimExpectations, validate_claims};
use libfuzzer_sys::fuzz_target;
use serde_json::{Map, Value, json};

/// Structured input representing a fuzzed assertion.
#[derive(Debug, Arbitrary)]
struct FuzzedAssertion {
    alg: FuzzedAlg,
    kid: Option<String>,
    iss: String,
    aud: FuzzedAudience,
    sub: String,
    email: Option<String>,
    hd: Option<String>,
    exp: i64,
    iat: i64,
    nbf: Option<i64>,
    access_levels: Option<Vec<String>>,
    signature_bytes: Vec<u8>,
    now: i64,
    leeway_secs: u32,
}

/// Algorithm values covering known attack vectors and edge cases.
#[derive(Debug, Arbitrary)]
enum FuzzedAlg {
    ES256,
    RS256,
    EdDSA,
    None,
    HS256,
    Other(String),
}

impl FuzzedAlg {
    fn as_str(&self) -> &str {
        match self {
            Self::ES256 => "ES256",
            Self::RS256 => "RS256",
            Self::EdDSA => "EdDSA",
            Self::None => "none",
            Self::HS256 => "HS256",
            Self::Other(s) => s,
        }
    }
}

#[derive(Debug, Arbitrary)]
enum FuzzedAudience {
    Single(String),
    Multiple(Vec<String>),
    Number(i64),
}

fn build_token(input: &FuzzedAssertion) -> String {
    let mut header = Map::new();
    header.insert("alg".to_string(), Value::String(input.alg.as_str().to_string()));
    if let Some(ref kid) = input.kid {
        header.insert("kid".to_string(), Value::String(kid.clone()));
    }

    let aud = match &input.aud {
        FuzzedAudience::Single(aud) => json!(aud),
        FuzzedAudience::Multiple(auds) => json!(auds),
        FuzzedAudience::Number(n) => json!(n),
    };
    let mut payload = Map::new();
    payload.insert("iss".to_string(), json!(input.iss));
    payload.insert("aud".to_string(), aud);
    payload.insert("sub".to_string(), json!(input.sub));
    if let Some(ref email) = input.email {
        payload.insert("email".to_string(), json!(email));
    }
    if let Some(ref hd) = input.hd {
        payload.insert("hd".to_string(), json!(hd));
    }
    payload.insert("exp".to_string(), json!(input.exp));
    payload.insert("iat".to_string(), json!(input.iat));
    if let Some(nbf) = input.nbf {
        payload.insert("nbf".to_string(), json!(nbf));
    }
    if let Some(ref levels) = input.access_levels {
        payload.insert("google".to_string(), json!({ "access_levels": levels }));
    }

    let header_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Value::Object(header)).unwrap_or_default());
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&Value::Object(payload)).unwrap_or_default());
    let sig_b64 = URL_SAFE_NO_PAD.encode(&input.signature_bytes);

    format!("{header_b64}.{payload_b64}.{sig_b64}")
}

fuzz_target!(|input: FuzzedAssertion| {
    let token = build_token(&input);

    let Ok(parsed) = AssertionToken::parse(&token) else {
        return;
    };
    let Ok(claims) = parsed.claims() else {
        return;
    };
    let Some(now) = DateTime::from_timestamp(input.now, 0) else {
        return;
    };

    let leeway = Duration::from_secs(u64::from(input.leeway_secs));
    let _ = validate_claims(
        &claims,
        &ClaimExpectations {
            issuer: "https://cloud.google.com/iap",
            audience: "/projects/123/apps/demo",
            leeway,
        },
        now,
    );
    let _ = validate_claims(
        &claims,
        &ClaimExpectations { issuer: &claims.iss, audience: &input.sub, leeway },
        now,
    );
});
