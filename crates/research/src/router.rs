//! Tier router
//!
//! Classifies a query into one of four handling tiers from surface cues:
//! 1. Recall: references to earlier conversations ("did we", "last time")
//! 2. DeepResearch: evidence-seeking vocabulary or long multi-clause questions
//! 3. SearchAugmented: freshness and lookup cues, including a year
//! 4. Direct: everything else
//!
//! Recall runs first so that "the studies we looked at" is not mistaken for
//! a research request.

use quarry_common::models::Tier;
use quarry_common::{metrics, text, AppError, Result};
use regex_lite::Regex;
use serde::Serialize;
use tracing::debug;

const RECALL_PATTERNS: &[&str] = &[
    r"(?i)\b(did|have|had) (we|you) (discuss|talk|research|look|find|cover|say|read|go over)",
    r"(?i)\bwe (discussed|talked about|researched|looked at|looked into|covered|went over)\b",
    r"(?i)\byou (found|said|mentioned|told me|showed me|suggested|recommended)\b",
    r"(?i)\b(remind me|last time|previously|earlier session|earlier conversation|our last|the other day)\b",
    r"(?i)\b(that|the|those) (study|paper|trial|article|source|result|results|studies|papers|trials)\b.*\b(we|you) (looked at|found|discussed|mentioned|saw|read|cited)\b",
];

const DEEP_CUES: &[&str] = &[
    "research", "evidence", "literature", "studies", "study", "systematic",
    "compare", "comparison", "comprehensive", "meta-analysis", "clinical",
    "trial", "trials", "randomized", "efficacy", "mechanism", "mechanisms",
    "pathophysiology", "epidemiology", "cohort", "peer-reviewed",
];

const FRESHNESS_CUES: &[&str] = &[
    "latest", "news", "today", "tonight", "current", "currently", "price",
    "prices", "recent", "recently", "now", "yesterday", "week", "announced",
    "release", "released", "score", "weather", "stock",
];

/// Word count from which a multi-clause question is treated as deep research
const LONG_QUERY_WORDS: usize = 18;
/// Clause separators (commas, semicolons, conjunctions) a long query needs
const MIN_CLAUSES: usize = 3;

const CLAUSE_WORDS: &[&str] = &["and", "but", "while", "whereas", "versus", "vs", "because", "although"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Routing {
    pub tier: Tier,
    /// Cue that decided the tier
    pub reason: &'static str,
}

pub struct TierRouter {
    recall: Vec<Regex>,
    year: Regex,
}

impl TierRouter {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::Internal {
                message: format!("Failed to compile routing pattern {:?}: {}", pattern, e),
            })
        };

        Ok(Self {
            recall: RECALL_PATTERNS.iter().map(|p| compile(p)).collect::<Result<_>>()?,
            year: compile(r"\b(19|20)\d{2}\b")?,
        })
    }

    fn is_recall(&self, query: &str) -> bool {
        self.recall.iter().any(|pattern| pattern.is_match(query))
    }

    fn clause_count(query: &str) -> usize {
        let punctuation = query.chars().filter(|c| matches!(c, ',' | ';' | ':')).count();
        let conjunctions = query
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| CLAUSE_WORDS.contains(&w.as_str()))
            .count();
        1 + punctuation + conjunctions
    }

    fn is_long_multi_clause(query: &str) -> bool {
        query.split_whitespace().count() >= LONG_QUERY_WORDS && Self::clause_count(query) >= MIN_CLAUSES
    }

    /// Route a query. Empty or whitespace-only text is the one failure.
    pub fn classify(&self, query: &str) -> Result<Routing> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::Unroutable {
                message: "query is empty".to_string(),
            });
        }

        let words = text::keyword_set(query);
        let has_cue = |cues: &[&str]| cues.iter().any(|cue| words.contains(*cue));

        let routing = if self.is_recall(query) {
            Routing { tier: Tier::Recall, reason: "recall_reference" }
        } else if has_cue(DEEP_CUES) {
            Routing { tier: Tier::DeepResearch, reason: "research_cue" }
        } else if Self::is_long_multi_clause(query) {
            Routing { tier: Tier::DeepResearch, reason: "multi_clause" }
        } else if has_cue(FRESHNESS_CUES) {
            Routing { tier: Tier::SearchAugmented, reason: "freshness_cue" }
        } else if self.year.is_match(query) {
            Routing { tier: Tier::SearchAugmented, reason: "year" }
        } else {
            Routing { tier: Tier::Direct, reason: "default" }
        };

        debug!(tier = %routing.tier, reason = routing.reason, "Query routed");
        metrics::record_tier(routing.tier.as_str());
        Ok(routing)
    }
}
