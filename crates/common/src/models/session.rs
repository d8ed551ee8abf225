//! Research sessions, rounds and lifecycle state

use super::candidate::{CandidateKey, SourceCandidate, SourceType};
use super::query::{Query, Tier};
use crate::errors::{AppError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Session lifecycle status. `Complete` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Judgement of the latest round's coverage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflectorVerdict {
    pub sufficient: bool,
    #[serde(default)]
    pub gaps: Vec<String>,
}

/// A source that failed or timed out during a round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source_type: SourceType,
    pub timed_out: bool,
    pub message: String,
}

/// One fetch -> rank -> reflect iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRound {
    /// 1-based, strictly increasing within a session
    pub round_number: u32,

    pub requested_counts: BTreeMap<SourceType, usize>,

    /// Newly scored candidates this round contributed (deduplicated)
    pub fetched_sources: Vec<SourceCandidate>,

    /// Top-N of the sources fetched by this round's run so far
    pub ranked_top_n: Vec<SourceCandidate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflector_verdict: Option<ReflectorVerdict>,

    #[serde(default)]
    pub failures: Vec<SourceFailure>,
}

/// Why the control loop continues or stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Continue,
    RoundCap,
    SourceCap,
    TimeBudget,
    ReflectorSatisfied,
    SourceOutage,
    SingleRound,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Continue => "continue",
            StopReason::RoundCap => "round_cap",
            StopReason::SourceCap => "source_cap",
            StopReason::TimeBudget => "time_budget",
            StopReason::ReflectorSatisfied => "reflector_satisfied",
            StopReason::SourceOutage => "source_outage",
            StopReason::SingleRound => "single_round",
            StopReason::Cancelled => "cancelled",
        }
    }
}

/// Outcome of the stopping-condition evaluator. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoppingDecision {
    pub continue_research: bool,
    pub reason: StopReason,
}

impl StoppingDecision {
    pub fn proceed() -> Self {
        Self {
            continue_research: true,
            reason: StopReason::Continue,
        }
    }

    pub fn stop(reason: StopReason) -> Self {
        Self {
            continue_research: false,
            reason,
        }
    }
}

/// What moved a session from active to complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTrigger {
    Satisfaction,
    NewTopic,
    TopicShift,
    Inactivity,
    HostSignal,
    Explicit,
    /// Every source failed; the session ends with a degraded answer
    SourceOutage,
}

impl CompletionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionTrigger::Satisfaction => "satisfaction",
            CompletionTrigger::NewTopic => "new_topic",
            CompletionTrigger::TopicShift => "topic_shift",
            CompletionTrigger::Inactivity => "inactivity",
            CompletionTrigger::HostSignal => "host_signal",
            CompletionTrigger::Explicit => "explicit",
            CompletionTrigger::SourceOutage => "source_outage",
        }
    }
}

/// Generated once, at completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub title: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub topic_keyphrases: Vec<String>,
}

impl SessionMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.summary.is_none() && self.topic_keyphrases.is_empty()
    }
}

/// A conversation with its research history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSession {
    pub session_id: Uuid,
    pub user_id: String,
    pub status: SessionStatus,
    pub tier: Tier,
    pub origin_query: Query,

    #[serde(default)]
    pub rounds: Vec<ResearchRound>,

    /// Every unique scored candidate seen across rounds
    #[serde(default)]
    pub corpus: Vec<SourceCandidate>,

    #[serde(default)]
    pub conversation: Vec<ConversationMessage>,

    pub title: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub topic_keyphrases: Vec<String>,

    /// Set when a round hit a full outage or the run was cut short
    #[serde(default)]
    pub degraded: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_trigger: Option<CompletionTrigger>,

    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ResearchSession {
    /// Start a session from its first query
    pub fn new(origin_query: Query, tier: Tier) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            user_id: origin_query.user_id.clone(),
            status: SessionStatus::Active,
            tier,
            origin_query,
            rounds: Vec::new(),
            corpus: Vec::new(),
            conversation: Vec::new(),
            title: None,
            summary: None,
            topic_keyphrases: Vec::new(),
            degraded: false,
            completion_trigger: None,
            created_at: now,
            last_updated: now,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Complete
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(AppError::SessionClosed {
                id: self.session_id.to_string(),
            })
        }
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn latest_round(&self) -> Option<&ResearchRound> {
        self.rounds.last()
    }

    /// Number the next appended round must carry
    pub fn next_round_number(&self) -> u32 {
        self.rounds.last().map(|r| r.round_number + 1).unwrap_or(1)
    }

    /// Rounds numbered `first_round` or later, i.e. those of one research run
    pub fn rounds_since(&self, first_round: u32) -> &[ResearchRound] {
        let start = self.rounds.partition_point(|r| r.round_number < first_round);
        &self.rounds[start..]
    }

    /// Distinct candidates fetched by rounds numbered `first_round` or later,
    /// including ones the corpus already held from earlier runs
    pub fn sources_since(&self, first_round: u32) -> Vec<SourceCandidate> {
        let mut seen = HashSet::new();
        self.rounds_since(first_round)
            .iter()
            .flat_map(|r| r.fetched_sources.iter())
            .filter(|c| seen.insert(c.key()))
            .cloned()
            .collect()
    }

    pub fn unique_source_count(&self) -> usize {
        self.corpus.len()
    }

    pub fn corpus_keys(&self) -> HashSet<CandidateKey> {
        self.corpus.iter().map(SourceCandidate::key).collect()
    }

    /// Append a ranked round and fold its new candidates into the corpus.
    ///
    /// Rejects out-of-sequence round numbers and any write to a completed
    /// session. Candidates already in the corpus are skipped.
    pub fn append_round(&mut self, round: ResearchRound) -> Result<()> {
        self.ensure_active()?;

        let expected = self.next_round_number();
        if round.round_number != expected {
            return Err(AppError::InvariantViolation {
                message: format!(
                    "round {} appended to session {} where round {} was expected",
                    round.round_number, self.session_id, expected
                ),
            });
        }

        let mut seen = self.corpus_keys();
        for candidate in &round.fetched_sources {
            if seen.insert(candidate.key()) {
                self.corpus.push(candidate.clone());
            }
        }

        self.rounds.push(round);
        self.touch();
        Ok(())
    }

    /// Attach the reflector's verdict to the latest round (once)
    pub fn record_verdict(&mut self, verdict: ReflectorVerdict) -> Result<()> {
        self.ensure_active()?;
        let session_id = self.session_id;
        let round = self.rounds.last_mut().ok_or_else(|| AppError::InvariantViolation {
            message: format!("verdict recorded on session {} before any round", session_id),
        })?;
        if round.reflector_verdict.is_none() {
            round.reflector_verdict = Some(verdict);
        }
        self.touch();
        Ok(())
    }

    pub fn append_message(&mut self, role: MessageRole, content: impl Into<String>) -> Result<()> {
        self.ensure_active()?;
        self.conversation.push(ConversationMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
        self.touch();
        Ok(())
    }

    pub fn mark_degraded(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.degraded = true;
        self.touch();
        Ok(())
    }

    /// Move to `Complete`, writing metadata exactly once.
    pub fn complete(&mut self, trigger: CompletionTrigger, metadata: SessionMetadata) -> Result<()> {
        self.ensure_active()?;
        let now = Utc::now();
        self.status = SessionStatus::Complete;
        self.completion_trigger = Some(trigger);
        self.title = metadata.title;
        self.summary = metadata.summary;
        self.topic_keyphrases = metadata.topic_keyphrases;
        self.completed_at = Some(now);
        self.last_updated = now;
        Ok(())
    }

    /// Full conversation as plain text, oldest first
    pub fn conversation_text(&self) -> String {
        self.conversation
            .iter()
            .map(|m| match m.role {
                MessageRole::User => format!("User: {}", m.content),
                MessageRole::Assistant => format!("Assistant: {}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The question currently being worked on: the latest user message,
    /// or the origin query before any message is recorded
    pub fn current_question(&self) -> &str {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or(&self.origin_query.text)
    }

    /// Date the current question was asked, used as "today" for recency
    pub fn current_question_date(&self) -> NaiveDate {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.timestamp.date_naive())
            .unwrap_or_else(|| self.origin_query.as_of())
    }

    pub fn last_assistant_message(&self) -> Option<&ConversationMessage> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ResearchSession {
        ResearchSession::new(Query::new("statins and dementia", "en", "u1"), Tier::DeepResearch)
    }

    fn round(number: u32, ids: &[&str]) -> ResearchRound {
        ResearchRound {
            round_number: number,
            requested_counts: BTreeMap::new(),
            fetched_sources: ids
                .iter()
                .map(|id| SourceCandidate::new(SourceType::Web, *id, "t", "s", "u"))
                .collect(),
            ranked_top_n: Vec::new(),
            reflector_verdict: None,
            failures: Vec::new(),
        }
    }

    #[test]
    fn test_rounds_strictly_increasing() {
        let mut s = session();
        s.append_round(round(1, &["a"])).unwrap();
        assert!(s.append_round(round(3, &["b"])).is_err());
        assert!(s.append_round(round(1, &["b"])).is_err());
        s.append_round(round(2, &["b"])).unwrap();
        assert_eq!(s.next_round_number(), 3);
    }

    #[test]
    fn test_corpus_deduplicates_by_key() {
        let mut s = session();
        s.append_round(round(1, &["a", "b"])).unwrap();
        s.append_round(round(2, &["b", "c"])).unwrap();
        assert_eq!(s.unique_source_count(), 3);
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut s = session();
        s.append_message(MessageRole::User, "hi").unwrap();
        s.complete(
            CompletionTrigger::Explicit,
            SessionMetadata {
                title: Some("Statins".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(s.is_complete());
        assert!(s.append_message(MessageRole::User, "again").is_err());
        assert!(s.append_round(round(1, &["a"])).is_err());
        assert!(s
            .complete(CompletionTrigger::Inactivity, SessionMetadata::default())
            .is_err());
        assert_eq!(s.title.as_deref(), Some("Statins"));
        assert_eq!(s.completion_trigger, Some(CompletionTrigger::Explicit));
    }

    #[test]
    fn test_run_scoped_views() {
        let mut s = session();
        s.append_round(round(1, &["a", "b"])).unwrap();
        s.append_round(round(2, &["c"])).unwrap();
        s.append_round(round(3, &["b", "d"])).unwrap();
        s.append_round(round(4, &["d", "e"])).unwrap();

        let run: Vec<u32> = s.rounds_since(3).iter().map(|r| r.round_number).collect();
        assert_eq!(run, vec![3, 4]);
        assert!(s.rounds_since(5).is_empty());
        assert_eq!(s.rounds_since(1).len(), 4);

        let ids: Vec<String> = s.sources_since(3).into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["b", "d", "e"]);
        assert_eq!(s.unique_source_count(), 5);
    }

    #[test]
    fn test_question_date_follows_latest_user_message() {
        let mut s = session();
        assert_eq!(s.current_question_date(), s.origin_query.as_of());

        let asked = DateTime::parse_from_rfc3339("2031-02-03T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        s.append_message(MessageRole::User, "and in the elderly?").unwrap();
        s.append_message(MessageRole::Assistant, "answer").unwrap();
        s.conversation[0].timestamp = asked;
        s.conversation[1].timestamp = asked + chrono::Duration::days(40);

        assert_eq!(s.current_question_date(), NaiveDate::from_ymd_opt(2031, 2, 3).unwrap());
    }

    #[test]
    fn test_verdict_recorded_once() {
        let mut s = session();
        assert!(s.record_verdict(ReflectorVerdict::default()).is_err());
        s.append_round(round(1, &["a"])).unwrap();
        s.record_verdict(ReflectorVerdict {
            sufficient: true,
            gaps: vec![],
        })
        .unwrap();
        s.record_verdict(ReflectorVerdict::default()).unwrap();
        assert!(s.latest_round().unwrap().reflector_verdict.as_ref().unwrap().sufficient);
    }
}
