//! Fuzz target for assertion parsing.
//!
//! Feeds arbitrary byte strings as tokens to the parser, the unverified
//! inspector and the header checks. Every result must be either `Ok(...)`
//! or `Err(AuthError)`; panics and hangs are bugs.

#![no_main]

use iap_authn::{
    diagnostics::inspect_unverified,
    token::AssertionToken,
    validation::{ACCEPTED_ALGORITHMS, validate_algorithm, validate_kid},
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Header values that reach the parser are always UTF-8
    let Ok(token) = std::str::from_utf8(data) else {
        return;
    };

    let _ = inspect_unverified(token);

    let Ok(parsed) = AssertionToken::parse(token) else {
        return;
    };

    let header = parsed.header();
    let _ = validate_algorithm(&header.alg, ACCEPTED_ALGORITHMS);
    if let Some(ref kid) = header.kid {
        let _ = validate_kid(kid);
    }

    let _ = parsed.claims();
});
