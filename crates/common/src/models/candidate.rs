//! Retrieved source candidates

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// External knowledge source family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// General web search
    Web,
    /// Peer-reviewed literature
    Literature,
    /// Preprint servers
    Preprint,
    /// Clinical trial registries
    ClinicalTrials,
}

impl SourceType {
    pub const ALL: [SourceType; 4] = [
        SourceType::Web,
        SourceType::Literature,
        SourceType::Preprint,
        SourceType::ClinicalTrials,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Web => "web",
            SourceType::Literature => "literature",
            SourceType::Preprint => "preprint",
            SourceType::ClinicalTrials => "clinical_trials",
        }
    }

    /// Ordering used to break score ties (higher wins)
    pub fn credibility_rank(&self) -> u8 {
        match self {
            SourceType::ClinicalTrials => 3,
            SourceType::Literature => 2,
            SourceType::Preprint => 1,
            SourceType::Web => 0,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(SourceType::Web),
            "literature" => Ok(SourceType::Literature),
            "preprint" => Ok(SourceType::Preprint),
            "clinical_trials" | "trials" => Ok(SourceType::ClinicalTrials),
            other => Err(format!("unknown source type: {other}")),
        }
    }
}

/// Identity of a candidate within a session corpus
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateKey {
    pub source_type: SourceType,
    pub id: String,
}

impl std::fmt::Display for CandidateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_type, self.id)
    }
}

/// A single retrieved result from one external source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    /// Source-local identifier (DOI, NCT number, URL hash, ...)
    pub id: String,

    pub source_type: SourceType,

    pub title: String,

    pub snippet: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<NaiveDate>,

    pub url: String,

    /// Cosine similarity to the query, clamped to [0, 1]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_score: Option<f32>,

    /// Raw score after credibility and recency multipliers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boosted_score: Option<f32>,
}

impl SourceCandidate {
    pub fn new(
        source_type: SourceType,
        id: impl Into<String>,
        title: impl Into<String>,
        snippet: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_type,
            title: title.into(),
            snippet: snippet.into(),
            published_date: None,
            url: url.into(),
            raw_score: None,
            boosted_score: None,
        }
    }

    pub fn with_published_date(mut self, date: NaiveDate) -> Self {
        self.published_date = Some(date);
        self
    }

    pub fn key(&self) -> CandidateKey {
        CandidateKey {
            source_type: self.source_type,
            id: self.id.clone(),
        }
    }

    /// Boosted score, treating unscored candidates as zero
    pub fn score(&self) -> f32 {
        self.boosted_score.unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_roundtrip_names() {
        for source in SourceType::ALL {
            assert_eq!(source.as_str().parse::<SourceType>().unwrap(), source);
        }
        assert_eq!("trials".parse::<SourceType>().unwrap(), SourceType::ClinicalTrials);
        assert!("rss".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_candidate_key_display() {
        let candidate = SourceCandidate::new(
            SourceType::Literature,
            "10.1000/xyz",
            "Title",
            "Snippet",
            "https://doi.org/10.1000/xyz",
        );
        assert_eq!(candidate.key().to_string(), "literature:10.1000/xyz");
        assert_eq!(candidate.score(), 0.0);
    }
}
