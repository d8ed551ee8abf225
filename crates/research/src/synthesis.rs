//! Answer synthesis
//!
//! Turns the ranked corpus into a cited answer. Sources are numbered in the
//! prompt and cited inline as `[n]`; citations are read back from the
//! generated text and mapped to candidate keys.

use async_trait::async_trait;
use quarry_common::llm::{self, GenerationRequest, Generator, OnToken};
use quarry_common::models::{CandidateKey, SourceCandidate};
use quarry_common::{text, AppError, Result};
use regex_lite::Regex;
use std::sync::Arc;
use std::time::Duration;

const SNIPPET_CHARS: usize = 600;

/// What the synthesizer is given
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub question: &'a str,
    /// Ranked sources, best first; citation `[n]` refers to `sources[n - 1]`
    pub sources: &'a [SourceCandidate],
    pub rounds: usize,
    pub degraded: bool,
}

/// Citation in a synthesized answer
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    /// 1-based marker as written in the answer
    pub index: usize,
    pub key: CandidateKey,
    /// Byte offset of the first marker in the answer
    pub position: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SynthesizedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    /// Stream the answer through `on_token` and return it with citations
    async fn synthesize(
        &self,
        input: SynthesisInput<'_>,
        on_token: &OnToken<'_>,
    ) -> Result<SynthesizedAnswer>;
}

pub struct LlmSynthesizer {
    generator: Arc<dyn Generator>,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
    citation_pattern: Regex,
}

impl LlmSynthesizer {
    pub fn new(generator: Arc<dyn Generator>, temperature: f32, max_tokens: usize, timeout: Duration) -> Result<Self> {
        let citation_pattern = Regex::new(r"\[(\d+)\]").map_err(|e| AppError::Internal {
            message: format!("Failed to compile citation pattern: {}", e),
        })?;

        Ok(Self {
            generator,
            temperature,
            max_tokens,
            timeout,
            citation_pattern,
        })
    }

    fn build_prompt(input: &SynthesisInput<'_>) -> String {
        let mut prompt = format!(
            "Answer the question using ONLY the numbered sources below. \
            Cite sources inline as [1], [2], etc. If the sources are not enough, say what is missing. \
            Do not make up information.\n\n\
            Question: {}\n\nSources ({} research rounds):\n",
            input.question, input.rounds
        );

        if input.sources.is_empty() {
            prompt.push_str("(no sources were retrieved)\n");
        }
        for (i, source) in input.sources.iter().enumerate() {
            let date = source
                .published_date
                .map(|d| d.to_string())
                .unwrap_or_else(|| "undated".to_string());
            prompt.push_str(&format!(
                "\n[{}] {} ({}, {})\n{}\n",
                i + 1,
                source.title,
                source.source_type,
                date,
                text::truncate_chars(&source.snippet, SNIPPET_CHARS)
            ));
        }

        if input.degraded {
            prompt.push_str("\nSome sources were unavailable; note that the answer may be incomplete.\n");
        }
        prompt.push_str("\nAnswer:");
        prompt
    }

    /// Markers in first-appearance order, unique, within `1..=sources.len()`
    pub fn extract_citations(&self, answer: &str, sources: &[SourceCandidate]) -> Vec<Citation> {
        let mut citations: Vec<Citation> = Vec::new();

        for cap in self.citation_pattern.captures_iter(answer) {
            let Some(index) = cap.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) else {
                continue;
            };
            if index == 0 || index > sources.len() || citations.iter().any(|c| c.index == index) {
                continue;
            }
            citations.push(Citation {
                index,
                key: sources[index - 1].key(),
                position: cap.get(0).map(|m| m.start()),
            });
        }

        citations
    }
}

#[async_trait]
impl AnswerSynthesizer for LlmSynthesizer {
    async fn synthesize(
        &self,
        input: SynthesisInput<'_>,
        on_token: &OnToken<'_>,
    ) -> Result<SynthesizedAnswer> {
        let request = GenerationRequest::new(
            "You are a careful research assistant who answers from evidence.",
            Self::build_prompt(&input),
        )
        .temperature(self.temperature)
        .max_tokens(self.max_tokens)
        .timeout(self.timeout);

        let answer = llm::bounded_streaming(self.generator.as_ref(), &request, on_token).await?;
        let citations = self.extract_citations(&answer, input.sources);

        Ok(SynthesizedAnswer { answer, citations })
    }
}
