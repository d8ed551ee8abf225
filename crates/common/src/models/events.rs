//! Streaming events delivered to clients

use super::candidate::{CandidateKey, SourceCandidate};
use super::query::Tier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Orchestration stage reported through `StageUpdate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Routing,
    Planning,
    Fetching,
    Ranking,
    Reflecting,
    Deciding,
    Synthesizing,
    Recalling,
    Answering,
    Done,
}

/// A source cited by a final answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRef {
    /// 1-based marker used in the answer text
    pub index: usize,
    pub key: CandidateKey,
    pub title: String,
    pub url: String,
}

impl CitationRef {
    pub fn from_candidate(index: usize, candidate: &SourceCandidate) -> Self {
        Self {
            index,
            key: candidate.key(),
            title: candidate.title.clone(),
            url: candidate.url.clone(),
        }
    }
}

/// Event kinds carried by the streaming transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    StageUpdate {
        stage: Stage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<u32>,
        message: String,
    },
    Token {
        text: String,
    },
    TierSelected {
        tier: Tier,
    },
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        answer: String,
        #[serde(default)]
        citations: Vec<CitationRef>,
        degraded: bool,
        /// True when built from partial state because the producer went away
        #[serde(default)]
        fallback: bool,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::StageUpdate { .. } => "stage-update",
            StreamEvent::Token { .. } => "token",
            StreamEvent::TierSelected { .. } => "tier-selected",
            StreamEvent::Completed { .. } => "completed",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Whether a client UI can stop waiting after this event
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed { .. } | StreamEvent::Error { .. })
    }

    pub fn stage(stage: Stage, round: Option<u32>, message: impl Into<String>) -> Self {
        StreamEvent::StageUpdate {
            stage,
            round,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_names() {
        let event = StreamEvent::TierSelected {
            tier: Tier::DeepResearch,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tier-selected");
        assert_eq!(json["tier"], "deep_research");
        assert_eq!(event.name(), "tier-selected");
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_completed_is_terminal() {
        let event = StreamEvent::Completed {
            session_id: None,
            answer: String::new(),
            citations: vec![],
            degraded: true,
            fallback: true,
        };
        assert!(event.is_terminal());
        assert_eq!(serde_json::to_value(&event).unwrap()["type"], "completed");
    }
}
