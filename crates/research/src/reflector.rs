//! Round reflector
//!
//! Judges whether the latest round's ranked sources cover the question well
//! enough to stop. The control loop only sees [`ReflectorVerdict`]s and never
//! assumes how they are produced.

use async_trait::async_trait;
use quarry_common::llm::{self, GenerationRequest, Generator};
use quarry_common::models::{ReflectorVerdict, ResearchSession};
use quarry_common::{text, AppError, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You review research progress. Given a question and the sources found so far, \
decide whether they are sufficient to answer it well. Respond with a single JSON object: \
{\"sufficient\": boolean, \"gaps\": [string]}. Gaps are short search phrases for what is still missing.";

const MAX_SOURCES_IN_PROMPT: usize = 15;
const MAX_GAPS: usize = 5;
const SNIPPET_CHARS: usize = 300;

#[async_trait]
pub trait Reflector: Send + Sync {
    /// Verdict on the session's latest round. Never fails: an unusable
    /// judgement reads as "insufficient, no gaps".
    async fn reflect(&self, session: &ResearchSession) -> ReflectorVerdict;
}

#[derive(Deserialize)]
struct RawVerdict {
    #[serde(default)]
    sufficient: bool,
    #[serde(default)]
    gaps: Vec<String>,
}

fn parse_verdict(raw: &str) -> Result<ReflectorVerdict> {
    let json = text::extract_json_object(raw).ok_or_else(|| AppError::GenerationError {
        message: "reflector response contained no JSON object".to_string(),
    })?;
    let parsed: RawVerdict = serde_json::from_str(json)?;

    let gaps = parsed
        .gaps
        .into_iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .take(MAX_GAPS)
        .collect();

    Ok(ReflectorVerdict {
        sufficient: parsed.sufficient,
        gaps,
    })
}

/// LLM-as-judge reflector
pub struct LlmReflector {
    generator: Arc<dyn Generator>,
    temperature: f32,
    timeout: Duration,
}

impl LlmReflector {
    pub fn new(generator: Arc<dyn Generator>, temperature: f32, timeout: Duration) -> Self {
        Self {
            generator,
            temperature,
            timeout,
        }
    }

    fn build_prompt(session: &ResearchSession) -> String {
        let mut prompt = format!("Question: {}\n\nSources found:\n", session.current_question());
        let sources = session
            .latest_round()
            .map(|r| r.ranked_top_n.as_slice())
            .unwrap_or_default();

        if sources.is_empty() {
            prompt.push_str("(none)\n");
        }
        for (i, source) in sources.iter().take(MAX_SOURCES_IN_PROMPT).enumerate() {
            prompt.push_str(&format!(
                "[{}] ({}) {}: {}\n",
                i + 1,
                source.source_type,
                source.title,
                text::truncate_chars(&source.snippet, SNIPPET_CHARS)
            ));
        }
        prompt
    }
}

#[async_trait]
impl Reflector for LlmReflector {
    async fn reflect(&self, session: &ResearchSession) -> ReflectorVerdict {
        let request = GenerationRequest::new(SYSTEM_PROMPT, Self::build_prompt(session))
            .temperature(self.temperature)
            .max_tokens(300)
            .timeout(self.timeout);

        let verdict = llm::bounded(self.generator.as_ref(), &request)
            .await
            .and_then(|raw| parse_verdict(&raw));

        match verdict {
            Ok(verdict) => {
                debug!(
                    session_id = %session.session_id,
                    sufficient = verdict.sufficient,
                    gaps = verdict.gaps.len(),
                    "Reflection complete"
                );
                verdict
            }
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "Reflection failed, treating round as insufficient");
                ReflectorVerdict::default()
            }
        }
    }
}

/// Returns the same verdict every round
pub struct FixedReflector {
    verdict: ReflectorVerdict,
}

impl FixedReflector {
    pub fn new(verdict: ReflectorVerdict) -> Self {
        Self { verdict }
    }

    pub fn insufficient(gaps: &[&str]) -> Self {
        Self::new(ReflectorVerdict {
            sufficient: false,
            gaps: gaps.iter().map(|g| g.to_string()).collect(),
        })
    }

    pub fn satisfied() -> Self {
        Self::new(ReflectorVerdict {
            sufficient: true,
            gaps: Vec::new(),
        })
    }
}

#[async_trait]
impl Reflector for FixedReflector {
    async fn reflect(&self, _session: &ResearchSession) -> ReflectorVerdict {
        self.verdict.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::llm::MockGenerator;
    use quarry_common::models::{Query, SourceCandidate, SourceType, Tier, ResearchRound};
    use std::collections::BTreeMap;

    fn session() -> ResearchSession {
        let mut s = ResearchSession::new(Query::new("statins and dementia", "en", "u1"), Tier::DeepResearch);
        s.append_round(ResearchRound {
            round_number: 1,
            requested_counts: BTreeMap::new(),
            fetched_sources: Vec::new(),
            ranked_top_n: vec![SourceCandidate::new(
                SourceType::Literature,
                "l1",
                "Statin use and incident dementia",
                "A cohort of 20,000 adults.",
                "https://doi.org/x",
            )],
            reflector_verdict: None,
            failures: Vec::new(),
        })
        .unwrap();
        s
    }

    fn reflector(generator: MockGenerator) -> LlmReflector {
        LlmReflector::new(Arc::new(generator), 0.1, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_parses_fenced_verdict() {
        let generator = MockGenerator::fixed(
            "Here you go:\n```json\n{\"sufficient\": false, \"gaps\": [\" randomized trials \", \"\", \"women\"]}\n```",
        );
        let verdict = reflector(generator).reflect(&session()).await;
        assert!(!verdict.sufficient);
        assert_eq!(verdict.gaps, vec!["randomized trials", "women"]);
    }

    #[tokio::test]
    async fn test_prompt_carries_question_and_sources() {
        let generator = MockGenerator::from_fn(|request| {
            assert!(request.prompt.contains("statins and dementia"));
            assert!(request.prompt.contains("[1] (literature) Statin use and incident dementia"));
            assert!((request.temperature - 0.1).abs() < f32::EPSILON);
            Ok("{\"sufficient\": true}".to_string())
        });
        let verdict = reflector(generator).reflect(&session()).await;
        assert!(verdict.sufficient);
        assert!(verdict.gaps.is_empty());
    }

    #[tokio::test]
    async fn test_failures_read_as_insufficient() {
        let verdict = reflector(MockGenerator::failing("down")).reflect(&session()).await;
        assert_eq!(verdict, ReflectorVerdict::default());

        let verdict = reflector(MockGenerator::fixed("not json")).reflect(&session()).await;
        assert_eq!(verdict, ReflectorVerdict::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_judge_times_out() {
        let generator = MockGenerator::fixed("{\"sufficient\": true}").with_delay(Duration::from_secs(60));
        let verdict = reflector(generator).reflect(&session()).await;
        assert!(!verdict.sufficient);
    }
}
