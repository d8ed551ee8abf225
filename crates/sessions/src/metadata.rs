//! Session metadata generation
//!
//! Title, summary and topic keyphrases are produced once, when a session
//! completes, from its conversation and top sources.

use quarry_common::llm::{self, GenerationRequest, Generator};
use quarry_common::models::{ResearchSession, SessionMetadata};
use quarry_common::{text, AppError, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You write index entries for finished research conversations. \
Respond with a single JSON object: {\"title\": string, \"summary\": string, \"keyphrases\": [string]}. \
The title is under 10 words, the summary 2-4 sentences, and 3-8 keyphrases.";

const MAX_KEYPHRASES: usize = 8;
const MAX_SOURCES_IN_PROMPT: usize = 10;

#[derive(Deserialize)]
struct RawMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default, alias = "topic_keyphrases")]
    keyphrases: Vec<String>,
}

pub struct MetadataGenerator {
    generator: Arc<dyn Generator>,
    timeout: Duration,
}

impl MetadataGenerator {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    fn build_prompt(session: &ResearchSession) -> String {
        let mut prompt = format!("Original question: {}\n\n", session.origin_query.text);

        let sources: Vec<&str> = session
            .latest_round()
            .map(|r| r.ranked_top_n.iter().map(|c| c.title.as_str()).collect())
            .unwrap_or_default();
        if !sources.is_empty() {
            prompt.push_str("Top sources:\n");
            for title in sources.into_iter().take(MAX_SOURCES_IN_PROMPT) {
                prompt.push_str(&format!("- {}\n", title));
            }
            prompt.push('\n');
        }

        prompt.push_str("Conversation:\n");
        prompt.push_str(&session.conversation_text());
        prompt
    }

    /// One generation call; any failure is returned to the caller
    pub async fn generate(&self, session: &ResearchSession) -> Result<SessionMetadata> {
        let request = GenerationRequest::new(SYSTEM_PROMPT, Self::build_prompt(session))
            .temperature(0.2)
            .max_tokens(400)
            .timeout(self.timeout);

        let raw = llm::bounded(self.generator.as_ref(), &request).await?;
        parse_metadata(&raw)
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_metadata(raw: &str) -> Result<SessionMetadata> {
    let json = text::extract_json_object(raw).ok_or_else(|| AppError::GenerationError {
        message: "metadata response contained no JSON object".to_string(),
    })?;
    let parsed: RawMetadata = serde_json::from_str(json).map_err(|e| AppError::GenerationError {
        message: format!("metadata response was not valid JSON: {}", e),
    })?;

    let mut keyphrases: Vec<String> = Vec::new();
    for phrase in parsed.keyphrases {
        let phrase = phrase.trim().to_lowercase();
        if !phrase.is_empty() && !keyphrases.contains(&phrase) {
            keyphrases.push(phrase);
        }
    }
    keyphrases.truncate(MAX_KEYPHRASES);

    Ok(SessionMetadata {
        title: clean(parsed.title),
        summary: clean(parsed.summary),
        topic_keyphrases: keyphrases,
    })
}
