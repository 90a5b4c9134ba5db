//! Pattern classification of human free-text requests.
//!
//! High-stakes wording wins over everything else so a "draft an eviction
//! plan" request is never treated as routine drafting. Otherwise the cue
//! that appears first in the text decides: "summarize the last email" is a
//! synthesis request about an email, "draft an email summarizing" is a draft.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Answerable from stored data, no language call.
    DataQuery,
    Synthesis,
    /// High-stakes decision support.
    Strategy,
    Drafting,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::DataQuery => "data_query",
            Intent::Synthesis => "synthesis",
            Intent::Strategy => "strategy",
            Intent::Drafting => "drafting",
        }
    }
}

// Compile-once patterns. A pattern that fails to compile never matches.
fn strategy_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(strateg\w*|should we|evict\w*|legal|lawsuit|litigat\w*|terminat\w+|non-?renew\w*|capital plan\w*|acquisition|acquire|dispos\w+|refinanc\w*)\b",
        )
        .ok()
    })
    .as_ref()
}

fn drafting_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(draft|write|compose|reply|respond|letter|notice|email|message)\b").ok()
    })
    .as_ref()
}

fn data_query_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(how many|how much|list|show|count|which|who|when did|what is|what's|what are)\b",
        )
        .ok()
    })
    .as_ref()
}

fn synthesis_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(summar\w*|explain|why|analy[sz]\w*|overview|brief\w*|compare|assess\w*|going on)\b",
        )
        .ok()
    })
    .as_ref()
}

/// Classify a free-text request. `None` when nothing matches.
pub fn classify(text: &str) -> Option<Intent> {
    if strategy_re().is_some_and(|re| re.is_match(text)) {
        return Some(Intent::Strategy);
    }
    // Ties keep this order.
    let ordered: [(Intent, Option<&'static Regex>); 3] = [
        (Intent::Drafting, drafting_re()),
        (Intent::DataQuery, data_query_re()),
        (Intent::Synthesis, synthesis_re()),
    ];
    ordered
        .into_iter()
        .filter_map(|(intent, re)| re?.find(text).map(|m| (m.start(), intent)))
        .min_by_key(|(start, _)| *start)
        .map(|(_, intent)| intent)
}
