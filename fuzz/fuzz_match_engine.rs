//! Fuzz target for message scanning.
//!
//! Run with: cargo +nightly fuzz run fuzz_match_engine
//!
//! The first byte splits the input into a trigger and a message. The trigger
//! is subscribed as both a word and a pattern, then the message is scanned by
//! both engines. Markup must never split a UTF-8 character.

#![no_main]

use highlight_config::PatternsConfig;
use highlight_core::{MatchEngine, TriggerKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let split = (data[0] as usize % (data.len() - 1)) + 1;
    let (Ok(trigger), Ok(content)) = (
        std::str::from_utf8(&data[1..split]),
        std::str::from_utf8(&data[split..]),
    ) else {
        return;
    };

    let config = PatternsConfig {
        size_limit: 64 * 1024,
        dfa_size_limit: 64 * 1024,
    };
    for kind in TriggerKind::ALL {
        let mut engine = MatchEngine::new(kind, &config);
        engine.index_mut().add_subscriber("g", trigger, "subscriber");
        let scan = engine.parse("g", "author", content);
        for result in &scan.outcome.results {
            assert!(result.parsed_content.len() >= content.len());
        }
    }
});
