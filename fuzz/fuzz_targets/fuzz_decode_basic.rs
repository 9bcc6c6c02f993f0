//! Fuzz target: Basic credential decoding.
//!
//! Arbitrary tokens must decode or fail cleanly, and any decoded username
//! must already be normalized.

#![no_main]

use base64::Engine as _;
use keel_core::auth::decode_basic;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw bytes as the header token.
    if let Ok(token) = std::str::from_utf8(data) {
        if let Ok(credentials) = decode_basic(token) {
            assert_eq!(credentials.username, credentials.username.trim().to_lowercase());
        }
    }

    // The same bytes as the decoded payload.
    let token = base64::engine::general_purpose::STANDARD.encode(data);
    match decode_basic(&token) {
        Ok(credentials) => {
            let text = std::str::from_utf8(data).expect("decoded credentials imply UTF-8");
            let password = text.split_once(':').map_or("", |(_, p)| p);
            assert_eq!(credentials.password, password, "password is everything after the first colon");
        }
        Err(_) => assert!(std::str::from_utf8(data).is_err(), "valid UTF-8 must decode"),
    }
});
