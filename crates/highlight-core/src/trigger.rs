//! Trigger kinds and the cosmetic label helpers shared by both kinds.

use std::fmt;

/// Marks a pattern that was stored in a column shared with plain words.
pub const KIND_MARKER: &str = "re:";

/// Inline flag group enabling case-insensitive matching.
pub const CASE_MARKER: &str = "(?i)";

/// The two disjoint trigger kinds. Each worker unit owns exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TriggerKind {
    /// Literal words or phrases, matched on token boundaries.
    Word,
    /// Regular expressions compiled through the pattern cache.
    RegularExpression,
}

impl TriggerKind {
    /// Both kinds, in the order their results are reported.
    pub const ALL: [TriggerKind; 2] = [TriggerKind::Word, TriggerKind::RegularExpression];

    /// Short lowercase name, as used in logs and thread names.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Word => "word",
            TriggerKind::RegularExpression => "regex",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The label shown to a user as "the thing that matched".
///
/// Strips the kind marker and then the case marker. Matching never uses this.
pub fn display_label(trigger: &str) -> &str {
    let label = trigger.strip_prefix(KIND_MARKER).unwrap_or(trigger);
    label.strip_prefix(CASE_MARKER).unwrap_or(label)
}

/// The pattern source handed to the regex compiler.
///
/// Only the kind marker is removed; the case marker is valid pattern syntax.
pub fn pattern_source(trigger: &str) -> &str {
    trigger.strip_prefix(KIND_MARKER).unwrap_or(trigger)
}
