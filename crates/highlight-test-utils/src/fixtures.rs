//! Subscription fixtures and polling helpers.

use std::sync::Arc;
use std::time::Duration;

use highlight_core::{MemoryStore, Subscription};

/// A guild used by the standard fixture set.
pub const GUILD: &str = "guild-1";

/// One user subscribed to one word.
pub fn word(guild_id: &str, user_id: &str, word: &str) -> Subscription {
    Subscription::new(guild_id, user_id).with_word(word)
}

/// One user subscribed to one pattern.
pub fn pattern(guild_id: &str, user_id: &str, pattern: &str) -> Subscription {
    Subscription::new(guild_id, user_id).with_pattern(pattern)
}

/// A shared in-memory store holding `subscriptions`.
pub fn store(subscriptions: Vec<Subscription>) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new(subscriptions))
}

/// A small guild: two word subscribers sharing a trigger, a phrase, and two
/// patterns of which one is broken.
pub fn sample_guild() -> Vec<Subscription> {
    vec![
        Subscription::new(GUILD, "alice")
            .with_word("rust")
            .with_pattern("cr[a]bs?"),
        Subscription::new(GUILD, "bob")
            .with_word("rust")
            .with_word("borrow checker"),
        pattern(GUILD, "carol", "[unclosed"),
    ]
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns whether it held.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
