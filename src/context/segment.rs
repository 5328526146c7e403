//! Context tiers and segments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Characters per token used for estimates (conservative for English text).
pub const CHARS_PER_TOKEN: f64 = 3.5;

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as usize
}

/// Cut `text` so that [`estimate_tokens`] of the result is at most `tokens`.
pub fn truncate_to_tokens(text: &str, tokens: usize) -> String {
    let max_chars = (tokens as f64 * CHARS_PER_TOKEN).floor() as usize;
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// The four context tiers, from pinned framing to deep history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Pinned framing; never evicted or altered by compaction.
    Head,
    /// Newest raw segments.
    Recent,
    /// Summaries of older recent segments.
    Mid,
    /// Heavily compacted history.
    Long,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Head, Tier::Recent, Tier::Mid, Tier::Long];

    pub fn index(self) -> usize {
        match self {
            Self::Head => 0,
            Self::Recent => 1,
            Self::Mid => 2,
            Self::Long => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Recent => "recent",
            Self::Mid => "mid",
            Self::Long => "long",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "head" => Ok(Self::Head),
            "recent" => Ok(Self::Recent),
            "mid" => Ok(Self::Mid),
            "long" => Ok(Self::Long),
            other => Err(format!("unknown context tier: {other}")),
        }
    }
}

/// A chunk of context state within one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSegment {
    pub tier: Tier,
    /// Tier-local ordering; assigned when the segment enters its tier.
    pub seq: u64,
    pub tokens: usize,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ContextSegment {
    /// A segment whose token count is estimated from its content.
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let tokens = estimate_tokens(&content);
        Self::with_tokens(content, tokens)
    }

    /// A segment with a caller-supplied token count (e.g. from a real tokenizer).
    pub fn with_tokens(content: impl Into<String>, tokens: usize) -> Self {
        Self {
            tier: Tier::Recent,
            seq: 0,
            tokens,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}
