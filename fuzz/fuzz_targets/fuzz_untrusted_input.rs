//! Fuzz testing for parsers that see untrusted input.
//!
//! Bearer tokens arrive from clients and rate-limit rules arrive from the
//! environment. Neither parser may panic, whatever the bytes.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the target
//! cargo +nightly fuzz run fuzz_untrusted_input
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_untrusted_input -- -max_total_time=60
//! ```

#![no_main]

use std::sync::OnceLock;
use std::time::Duration;

use admission_guard::auth::TokenCodec;
use admission_guard::limiter::{match_rule, parse_rules};
use libfuzzer_sys::fuzz_target;

fn codec() -> &'static TokenCodec {
    static CODEC: OnceLock<TokenCodec> = OnceLock::new();
    CODEC.get_or_init(|| {
        TokenCodec::new(
            b"fuzzing-secret-0123456789abcdef",
            "admission-guard".to_string(),
            Duration::from_secs(7200),
        )
        .expect("static secret is long enough")
    })
}

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    // Token validation (shouldn't panic)
    let _ = codec().validate(s);

    // Rule parsing, then matching the same input as a path (shouldn't panic)
    if let Ok(rules) = parse_rules(s) {
        let _ = match_rule(&rules, s);
    }
});
