//! Recall search over completed sessions
//!
//! Scores each completed session by how much of the query's vocabulary its
//! fields cover, weighted title 3.0, summary 2.0, keyphrases 2.5 and
//! conversation 1.0, normalized to [0, 1]. Sessions that completed without
//! metadata are matched on their raw conversation text instead.

use crate::store::SessionStore;
use chrono::{DateTime, NaiveDate, Utc};
use quarry_common::config::RecallConfig;
use quarry_common::llm::{self, GenerationRequest, Generator};
use quarry_common::models::{Query, ResearchSession};
use quarry_common::{metrics, text, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const TITLE_WEIGHT: f32 = 3.0;
const SUMMARY_WEIGHT: f32 = 2.0;
const KEYPHRASE_WEIGHT: f32 = 2.5;
const CONVERSATION_WEIGHT: f32 = 1.0;
const TOTAL_WEIGHT: f32 = TITLE_WEIGHT + SUMMARY_WEIGHT + KEYPHRASE_WEIGHT + CONVERSATION_WEIGHT;

/// Words that mark a recall request without describing its subject
const RECALL_NOISE: &[&str] = &[
    "remind", "remember", "recall", "previously", "earlier", "last", "time", "before",
    "discussed", "discuss", "talked", "talk", "found", "find", "looked", "look", "said",
    "conversation", "session", "again", "back", "ago", "research", "researched",
];

const NO_MATCH_OFFER: &str = "I couldn't find an earlier research session about that. \
Would you like me to research it now?";

const ANSWER_SYSTEM_PROMPT: &str = "You answer follow-up questions from a previous research \
conversation. Use only the conversation provided. Begin by stating the date the research was \
done, then answer concisely.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallField {
    Title,
    Summary,
    Keyphrases,
    Conversation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallMatch {
    pub session_id: Uuid,
    pub relevance_score: f32,
    pub matched_fields: Vec<RecallField>,
    pub title: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecallOutcome {
    /// Nothing relevant; offer to research the question instead
    NoMatch { offer: String },
    /// One session clearly matched and was answered from
    Answer {
        session_id: Uuid,
        session_date: NaiveDate,
        answer: String,
        /// True when the answer came from stored text, not generation
        degraded: bool,
    },
    /// Several sessions matched comparably
    Disambiguate {
        prompt: String,
        candidates: Vec<RecallMatch>,
    },
}

pub struct RecallSearch {
    store: Arc<dyn SessionStore>,
    generator: Arc<dyn Generator>,
    config: RecallConfig,
}

fn coverage(query: &HashSet<String>, field: &str) -> f32 {
    if field.is_empty() {
        return 0.0;
    }
    let field_words = text::keyword_set(field);
    query.intersection(&field_words).count() as f32 / query.len() as f32
}

fn session_date(session: &ResearchSession) -> NaiveDate {
    session.completed_at.unwrap_or(session.created_at).date_naive()
}

impl RecallSearch {
    pub fn new(store: Arc<dyn SessionStore>, generator: Arc<dyn Generator>, config: RecallConfig) -> Self {
        Self {
            store,
            generator,
            config,
        }
    }

    /// Subject keywords of a recall query
    fn query_terms(query: &str) -> HashSet<String> {
        text::keywords(query)
            .into_iter()
            .filter(|w| !RECALL_NOISE.contains(&w.as_str()))
            .collect()
    }

    /// Score one completed session against the query terms
    pub fn score(terms: &HashSet<String>, session: &ResearchSession) -> (f32, Vec<RecallField>) {
        if terms.is_empty() {
            return (0.0, Vec::new());
        }

        let conversation = format!("{}\n{}", session.origin_query.text, session.conversation_text());
        let has_metadata = session.title.is_some()
            || session.summary.is_some()
            || !session.topic_keyphrases.is_empty();

        if !has_metadata {
            let raw = coverage(terms, &conversation);
            let fields = if raw > 0.0 { vec![RecallField::Conversation] } else { Vec::new() };
            return (raw, fields);
        }

        let scored = [
            (RecallField::Title, TITLE_WEIGHT, coverage(terms, session.title.as_deref().unwrap_or_default())),
            (RecallField::Summary, SUMMARY_WEIGHT, coverage(terms, session.summary.as_deref().unwrap_or_default())),
            (RecallField::Keyphrases, KEYPHRASE_WEIGHT, coverage(terms, &session.topic_keyphrases.join(" "))),
            (RecallField::Conversation, CONVERSATION_WEIGHT, coverage(terms, &conversation)),
        ];

        let score = scored.iter().map(|(_, w, c)| w * c).sum::<f32>() / TOTAL_WEIGHT;
        let fields = scored
            .iter()
            .filter(|(_, _, c)| *c > 0.0)
            .map(|(f, _, _)| *f)
            .collect();
        (score.clamp(0.0, 1.0), fields)
    }

    /// Ranked matches among completed sessions, at most `limit`
    #[instrument(skip(self))]
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<RecallMatch>> {
        let terms = Self::query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let sessions = self.store.list_complete().await?;
        let mut matches: Vec<RecallMatch> = sessions
            .iter()
            .filter_map(|session| {
                let (score, fields) = Self::score(&terms, session);
                (score >= self.config.min_score).then(|| RecallMatch {
                    session_id: session.session_id,
                    relevance_score: score,
                    matched_fields: fields,
                    title: session.title.clone(),
                    completed_at: session.completed_at,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        matches.truncate(limit);

        debug!(candidates = sessions.len(), matched = matches.len(), "Recall search complete");
        Ok(matches)
    }

    /// Resolve a recall query into an answer, a disambiguation or an offer
    #[instrument(skip(self, query), fields(user_id = %query.user_id))]
    pub async fn recall(&self, query: &Query) -> Result<RecallOutcome> {
        let matches = self.search(&query.text, self.config.default_limit).await?;

        let clear_winner = match matches.as_slice() {
            [] => None,
            [only] => Some(only.session_id),
            [top, runner_up, ..] => (top.relevance_score - runner_up.relevance_score
                > self.config.disambiguation_margin)
                .then_some(top.session_id),
        };

        let outcome = match clear_winner {
            _ if matches.is_empty() => RecallOutcome::NoMatch {
                offer: NO_MATCH_OFFER.to_string(),
            },
            Some(session_id) => self.answer_from(session_id, query).await?,
            None => RecallOutcome::Disambiguate {
                prompt: disambiguation_prompt(&matches),
                candidates: matches,
            },
        };

        metrics::record_recall(match &outcome {
            RecallOutcome::NoMatch { .. } => "no_match",
            RecallOutcome::Answer { .. } => "answer",
            RecallOutcome::Disambiguate { .. } => "disambiguate",
        });
        Ok(outcome)
    }

    /// Answer from one specific completed session
    pub async fn answer_from(&self, session_id: Uuid, query: &Query) -> Result<RecallOutcome> {
        let session = self.store.get(session_id).await?;
        let date = session_date(&session);
        let date_label = date.format("%B %-d, %Y").to_string();

        let prompt = format!(
            "Research date: {}\nTopic: {}\nSummary: {}\n\nConversation:\n{}\n\nQuestion: {}",
            date_label,
            session.title.as_deref().unwrap_or(&session.origin_query.text),
            session.summary.as_deref().unwrap_or("(none)"),
            session.conversation_text(),
            query.text
        );
        let request = GenerationRequest::new(ANSWER_SYSTEM_PROMPT, prompt)
            .temperature(0.2)
            .max_tokens(600)
            .timeout(Duration::from_secs(self.config.answer_timeout_secs));

        let (answer, degraded) = match llm::bounded(self.generator.as_ref(), &request).await {
            Ok(answer) if !answer.trim().is_empty() => (answer, false),
            Ok(_) => (stored_answer(&session), true),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Recall answer generation failed");
                (stored_answer(&session), true)
            }
        };

        let answer = if answer.contains(&date_label) {
            answer
        } else {
            format!("From your research on {}: {}", date_label, answer)
        };

        Ok(RecallOutcome::Answer {
            session_id,
            session_date: date,
            answer,
            degraded,
        })
    }
}

/// Best stored text when generation is unavailable
fn stored_answer(session: &ResearchSession) -> String {
    session
        .summary
        .clone()
        .or_else(|| session.last_assistant_message().map(|m| m.content.clone()))
        .unwrap_or_else(|| format!("you researched \"{}\".", session.origin_query.text))
}

fn disambiguation_prompt(matches: &[RecallMatch]) -> String {
    let mut prompt = String::from("I found several earlier sessions that could match:\n");
    for (i, m) in matches.iter().enumerate() {
        let title = m.title.as_deref().unwrap_or("Untitled session");
        match m.completed_at {
            Some(at) => prompt.push_str(&format!("{}. {} ({})\n", i + 1, title, at.format("%B %-d, %Y"))),
            None => prompt.push_str(&format!("{}. {}\n", i + 1, title)),
        }
    }
    prompt.push_str("Which one did you mean?");
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;
    use quarry_common::llm::MockGenerator;
    use quarry_common::models::{CompletionTrigger, MessageRole, SessionMetadata, Tier};

    async fn completed_session(
        store: &Arc<dyn SessionStore>,
        question: &str,
        answer: &str,
        metadata: SessionMetadata,
    ) -> Uuid {
        let session = ResearchSession::new(Query::new(question, "en", "u1"), Tier::DeepResearch);
        let id = session.session_id;
        store.insert(session).await.unwrap();
        store.append_message(id, MessageRole::User, question.into()).await.unwrap();
        store.append_message(id, MessageRole::Assistant, answer.into()).await.unwrap();
        store.complete(id, CompletionTrigger::Explicit, metadata).await.unwrap();
        id
    }

    fn metadata(title: &str, summary: &str, keyphrases: &[&str]) -> SessionMetadata {
        SessionMetadata {
            title: Some(title.into()),
            summary: Some(summary.into()),
            topic_keyphrases: keyphrases.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn search_with(store: Arc<dyn SessionStore>, generator: MockGenerator) -> RecallSearch {
        RecallSearch::new(store, Arc::new(generator), RecallConfig::default())
    }

    #[tokio::test]
    async fn test_no_completed_sessions_offers_research() {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let active = ResearchSession::new(Query::new("statins dementia", "en", "u1"), Tier::DeepResearch);
        store.insert(active).await.unwrap();

        let search = search_with(store, MockGenerator::fixed("unused"));
        assert!(search.search("statins dementia", 5).await.unwrap().is_empty());

        let outcome = search
            .recall(&Query::new("what did we find about statins and dementia", "en", "u1"))
            .await
            .unwrap();
        assert!(matches!(outcome, RecallOutcome::NoMatch { .. }));
    }

    #[tokio::test]
    async fn test_near_identical_title_answers_directly() {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let id = completed_session(
            &store,
            "Do statins reduce dementia risk?",
            "Observational data suggest a modest reduction.",
            metadata(
                "Statins and dementia risk",
                "Statins were associated with a modest dementia risk reduction.",
                &["statins", "dementia risk"],
            ),
        )
        .await;
        completed_session(
            &store,
            "Best sourdough hydration?",
            "Around 75 percent.",
            metadata("Sourdough hydration", "Bread baking ratios.", &["sourdough"]),
        )
        .await;

        let search = search_with(store, MockGenerator::fixed("You found a modest reduction."));
        let matches = search.search("what did we find about statins and dementia risk", 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].session_id, id);
        assert!(matches[0].relevance_score > 0.8);
        assert!(matches[0].matched_fields.contains(&RecallField::Title));

        let query = Query::new("remind me what we found about statins and dementia risk", "en", "u1");
        match search.recall(&query).await.unwrap() {
            RecallOutcome::Answer {
                session_id,
                session_date,
                answer,
                degraded,
            } => {
                assert_eq!(session_id, id);
                assert!(!degraded);
                assert!(answer.contains(&session_date.format("%B %-d, %Y").to_string()));
                assert!(answer.contains("modest reduction"));
            }
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_comparable_matches_disambiguate() {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        for title in ["Statins and dementia in women", "Statins and dementia in men"] {
            completed_session(
                &store,
                "statins dementia",
                "answer",
                metadata(title, "Statins and dementia.", &["statins", "dementia"]),
            )
            .await;
        }

        let search = search_with(store, MockGenerator::fixed("unused"));
        let outcome = search
            .recall(&Query::new("what did we discuss about statins and dementia", "en", "u1"))
            .await
            .unwrap();
        match outcome {
            RecallOutcome::Disambiguate { prompt, candidates } => {
                assert_eq!(candidates.len(), 2);
                assert!(prompt.contains("Which one did you mean?"));
                assert!(candidates[0].session_id < candidates[1].session_id);
            }
            other => panic!("expected disambiguation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generation_failure_falls_back_to_summary() {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        completed_session(
            &store,
            "Do statins reduce dementia risk?",
            "Modest reduction.",
            metadata("Statins and dementia risk", "Stored summary text.", &["statins"]),
        )
        .await;

        let search = search_with(store, MockGenerator::failing("offline"));
        let query = Query::new("what did we find about statins and dementia risk", "en", "u1");
        match search.recall(&query).await.unwrap() {
            RecallOutcome::Answer { answer, degraded, .. } => {
                assert!(degraded);
                assert!(answer.starts_with("From your research on"));
                assert!(answer.contains("Stored summary text."));
            }
            other => panic!("expected answer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sessions_without_metadata_match_raw_text() {
        let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let id = completed_session(
            &store,
            "Compare lithium and valproate for bipolar maintenance",
            "Lithium has the stronger evidence base.",
            SessionMetadata::default(),
        )
        .await;

        let search = search_with(store, MockGenerator::fixed("unused"));
        let matches = search.search("lithium valproate bipolar", 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].session_id, id);
        assert_eq!(matches[0].matched_fields, vec![RecallField::Conversation]);
    }
}
