//! Compiled pattern cache with validity memoization.
//!
//! Each trigger string is compiled at most once for the lifetime of the
//! owning worker unit. A pattern that fails to compile is remembered as
//! invalid and never retried: compilation is deterministic, so the same input
//! fails the same way every time.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use highlight_config::PatternsConfig;

use crate::trigger::pattern_source;

/// Memoized trigger → compiled matcher map.
///
/// `None` entries record triggers known to be invalid.
pub struct PatternCache {
    entries: HashMap<String, Option<Regex>>,
    size_limit: usize,
    dfa_size_limit: usize,
    compilations: u64,
}

impl PatternCache {
    /// An empty cache compiling with the configured size limits.
    pub fn new(config: &PatternsConfig) -> Self {
        Self {
            entries: HashMap::new(),
            size_limit: config.size_limit,
            dfa_size_limit: config.dfa_size_limit,
            compilations: 0,
        }
    }

    /// Whether `trigger` compiles. Never errors; an invalid trigger is `false`.
    pub fn is_valid(&mut self, trigger: &str) -> bool {
        self.get(trigger).is_some()
    }

    /// The compiled matcher for `trigger`, compiling it on first use.
    pub fn get(&mut self, trigger: &str) -> Option<&Regex> {
        if !self.entries.contains_key(trigger) {
            let compiled = self.compile(trigger);
            self.entries.insert(trigger.to_string(), compiled);
        }
        self.entries.get(trigger).and_then(Option::as_ref)
    }

    /// Number of compilation attempts made so far.
    pub fn compilations(&self) -> u64 {
        self.compilations
    }

    /// Number of distinct triggers seen, valid or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no trigger has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn compile(&mut self, trigger: &str) -> Option<Regex> {
        self.compilations += 1;
        match RegexBuilder::new(pattern_source(trigger))
            .size_limit(self.size_limit)
            .dfa_size_limit(self.dfa_size_limit)
            .build()
        {
            Ok(regex) => Some(regex),
            Err(e) => {
                debug!(trigger = %trigger, error = %e, "Pattern failed to compile");
                None
            }
        }
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new(&PatternsConfig::default())
    }
}
