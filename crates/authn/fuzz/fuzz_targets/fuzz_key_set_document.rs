//! Fuzz target for key-set document parsing.
//!
//! Published key sets come from the network, so parsing must reject any
//! malformed JWKS or PEM map with an error rather than a panic.

#![no_main]

use iap_authn::{SigningKeySet, validation::ACCEPTED_ALGORITHMS};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(set) = SigningKeySet::from_json(data) else {
        return;
    };

    for kid in set.kids() {
        let Some(key) = set.get(kid) else {
            continue;
        };
        for alg in ACCEPTED_ALGORITHMS {
            let _ = key.can_verify(*alg);
        }
    }
});
