//! Match engine: turns one message into the highlights it triggers.
//!
//! An engine is parameterised by its [`TriggerKind`] and owns the
//! [`GuildIndex`] and [`PatternCache`] for that kind. A scan walks the
//! message's guild map in index order and applies two rules:
//!
//! - the author never matches their own message;
//! - a subscriber is reported at most once per scan, for the first trigger
//!   (in index order) that matched.
//!
//! Broken regular expressions are reported as [`InvalidTrigger`]s and removed
//! from the index instead of failing the scan.

use std::collections::{BTreeSet, HashSet};

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use highlight_config::PatternsConfig;

use crate::index::GuildIndex;
use crate::pattern::PatternCache;
use crate::trigger::{TriggerKind, display_label};

const STRONG: &str = "**";
const UNDERLINE: &str = "__";

/// One subscriber notified by one trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HighlightResult {
    pub member_id: String,
    /// Display label of the trigger that fired (markers stripped).
    pub trigger: String,
    /// Message content with every matched span emphasised.
    pub parsed_content: String,
}

/// Results of scanning one message with one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseOutcome {
    pub results: Vec<HighlightResult>,
    pub matched_user_ids: Vec<String>,
}

impl ParseOutcome {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// A stored pattern that failed to compile, one per affected subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTrigger {
    pub guild_id: String,
    pub user_id: String,
    pub trigger: String,
}

/// Everything a scan produced: the highlights plus any triggers found broken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub outcome: ParseOutcome,
    pub invalid: Vec<InvalidTrigger>,
}

/// Index and matcher state for one trigger kind.
pub struct MatchEngine {
    kind: TriggerKind,
    index: GuildIndex,
    patterns: PatternCache,
}

impl MatchEngine {
    /// An engine with an empty index.
    pub fn new(kind: TriggerKind, config: &PatternsConfig) -> Self {
        Self {
            kind,
            index: GuildIndex::new(),
            patterns: PatternCache::new(config),
        }
    }

    /// The trigger kind this engine matches.
    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    /// The subscriptions this engine scans against.
    pub fn index(&self) -> &GuildIndex {
        &self.index
    }

    /// Mutable access for loading and updating subscriptions.
    pub fn index_mut(&mut self) -> &mut GuildIndex {
        &mut self.index
    }

    /// Whether `input` compiles as a pattern, memoized in the pattern cache.
    pub fn validate(&mut self, input: &str) -> bool {
        self.patterns.is_valid(input)
    }

    /// Scan `content`, posted by `author_id` in `guild_id`.
    pub fn parse(&mut self, guild_id: &str, author_id: &str, content: &str) -> Scan {
        let Some(triggers) = self.index.guild(guild_id) else {
            return Scan::default();
        };
        if triggers.is_empty() {
            return Scan::default();
        }

        let mut collector = Collector::new(author_id);
        let mut invalid = Vec::new();
        let mut broken = Vec::new();

        match self.kind {
            TriggerKind::Word => {
                let tokens = tokenize(content);
                for (trigger, subscribers) in triggers {
                    if subscribers.is_empty() {
                        continue;
                    }
                    if let Some(marked) = mark_words(content, &tokens, trigger) {
                        collector.push(trigger, subscribers, &marked);
                    }
                }
            }
            TriggerKind::RegularExpression => {
                for (trigger, subscribers) in triggers {
                    let Some(regex) = self.patterns.get(trigger) else {
                        invalid.extend(subscribers.iter().map(|user_id| InvalidTrigger {
                            guild_id: guild_id.to_string(),
                            user_id: user_id.clone(),
                            trigger: trigger.clone(),
                        }));
                        broken.push(trigger.clone());
                        continue;
                    };
                    if subscribers.is_empty() {
                        continue;
                    }
                    if let Some(marked) = mark_pattern(content, regex) {
                        collector.push(trigger, subscribers, &marked);
                    }
                }
            }
        }

        for trigger in broken {
            warn!(guild = %guild_id, trigger = %trigger, "Dropping invalid pattern from index");
            self.index.remove_trigger(guild_id, &trigger);
        }

        Scan {
            outcome: collector.finish(),
            invalid,
        }
    }
}

/// Accumulates results with author exclusion and per-scan dedup.
struct Collector<'a> {
    author_id: &'a str,
    matched: HashSet<String>,
    outcome: ParseOutcome,
}

impl<'a> Collector<'a> {
    fn new(author_id: &'a str) -> Self {
        Self {
            author_id,
            matched: HashSet::new(),
            outcome: ParseOutcome::default(),
        }
    }

    fn push(&mut self, trigger: &str, subscribers: &BTreeSet<String>, parsed_content: &str) {
        let label = display_label(trigger);
        for user_id in subscribers {
            if user_id == self.author_id || self.matched.contains(user_id) {
                continue;
            }
            self.matched.insert(user_id.clone());
            self.outcome.matched_user_ids.push(user_id.clone());
            self.outcome.results.push(HighlightResult {
                member_id: user_id.clone(),
                trigger: label.to_string(),
                parsed_content: parsed_content.to_string(),
            });
        }
    }

    fn finish(self) -> ParseOutcome {
        self.outcome
    }
}

/// A word-ish chunk of text with its byte span and case-folded form.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    start: usize,
    end: usize,
    folded: String,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut start = None;

    for (i, c) in text.char_indices() {
        if is_word_char(c) {
            start.get_or_insert(i);
        } else if let Some(s) = start.take() {
            tokens.push(Token {
                start: s,
                end: i,
                folded: text[s..i].to_lowercase(),
            });
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            start: s,
            end: text.len(),
            folded: text[s..].to_lowercase(),
        });
    }

    tokens
}

/// Emphasise every occurrence of the word or phrase `trigger` in `content`.
///
/// Occurrences are found on the token stream, so "word" does not fire inside
/// "swordfish". Returns `None` when nothing matched.
fn mark_words(content: &str, tokens: &[Token], trigger: &str) -> Option<String> {
    let needle: Vec<String> = tokenize(trigger).into_iter().map(|t| t.folded).collect();
    let n = needle.len();
    if n == 0 || n > tokens.len() {
        return None;
    }

    let mut spans = Vec::new();
    let mut i = 0;
    while i + n <= tokens.len() {
        let window = &tokens[i..i + n];
        if window.iter().zip(&needle).all(|(t, w)| t.folded == *w) {
            spans.push((window[0].start, window[n - 1].end));
            i += n;
        } else {
            i += 1;
        }
    }

    (!spans.is_empty()).then(|| emphasise(content, &spans))
}

/// Emphasise every non-empty match of `regex` in `content`.
fn mark_pattern(content: &str, regex: &Regex) -> Option<String> {
    let spans: Vec<(usize, usize)> = regex
        .find_iter(content)
        .filter(|m| !m.is_empty())
        .map(|m| (m.start(), m.end()))
        .collect();

    (!spans.is_empty()).then(|| emphasise(content, &spans))
}

/// Wrap each span in strong emphasis, or underline when the span is pure
/// whitespace (bold whitespace renders as nothing).
///
/// Spans must be sorted, non-overlapping, and on char boundaries.
fn emphasise(content: &str, spans: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(content.len() + spans.len() * 4);
    let mut last = 0;

    for &(start, end) in spans {
        let matched = &content[start..end];
        let marker = if matched.chars().all(char::is_whitespace) {
            UNDERLINE
        } else {
            STRONG
        };
        out.push_str(&content[last..start]);
        out.push_str(marker);
        out.push_str(matched);
        out.push_str(marker);
        last = end;
    }
    out.push_str(&content[last..]);

    out
}
