//! Incoming queries and routing tiers

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A user query. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub locale: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>, locale: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            locale: locale.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Build a query with an explicit timestamp (replays, tests)
    pub fn at(
        text: impl Into<String>,
        locale: impl Into<String>,
        user_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            text: text.into(),
            locale: locale.into(),
            user_id: user_id.into(),
            timestamp,
        }
    }

    /// Reference date for recency boosts
    pub fn as_of(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Research effort bucket chosen by the tier router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Answer from a previously completed session
    Recall,
    /// Answer directly, no retrieval
    Direct,
    /// Single retrieval round before answering
    SearchAugmented,
    /// Multi-round fetch/rank/reflect loop
    DeepResearch,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Recall => "recall",
            Tier::Direct => "direct",
            Tier::SearchAugmented => "search_augmented",
            Tier::DeepResearch => "deep_research",
        }
    }

    /// Whether this tier fans out to external sources
    pub fn uses_retrieval(&self) -> bool {
        matches!(self, Tier::SearchAugmented | Tier::DeepResearch)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
