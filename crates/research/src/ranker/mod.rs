//! Relevance ranker
//!
//! Scores candidates by embedding similarity to the question, then applies
//! the deterministic credibility and recency multipliers from [`boosts`].
//! Ordering is total, so ranking the same inputs twice gives the same list.

pub mod boosts;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use quarry_common::config::{RankingConfig, ResearchConfig};
use quarry_common::embeddings::cosine_similarity;
use quarry_common::models::{CandidateKey, SourceCandidate};
use quarry_common::{metrics, text, AppError, Embedder, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Output of one ranking pass
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    /// Top N of the merged corpus
    pub top_n: Vec<SourceCandidate>,
    /// Candidates scored in this pass (unique, not previously seen)
    pub newly_scored: Vec<SourceCandidate>,
}

pub struct Ranker {
    embedder: Arc<dyn Embedder>,
    ranking: RankingConfig,
    top_n: usize,
    max_candidates: usize,
    snippet_chars: usize,
    concurrency: usize,
}

impl Ranker {
    pub fn new(embedder: Arc<dyn Embedder>, ranking: RankingConfig, research: &ResearchConfig) -> Self {
        Self {
            embedder,
            ranking,
            top_n: research.top_n,
            max_candidates: research.max_candidates,
            snippet_chars: research.snippet_chars,
            concurrency: research.embed_concurrency.max(1),
        }
    }

    fn candidate_text(&self, candidate: &SourceCandidate) -> String {
        format!(
            "{}\n{}",
            candidate.title,
            text::truncate_chars(&candidate.snippet, self.snippet_chars)
        )
    }

    /// Cosine scores clamped to [0, 1]; a failed or mis-sized candidate
    /// embedding scores 0 without affecting the others.
    async fn raw_scores(
        &self,
        query_vector: &[f32],
        candidates: &[SourceCandidate],
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        let texts: Vec<String> = candidates.iter().map(|c| self.candidate_text(c)).collect();
        let pending: Vec<_> = texts.iter().map(|text| self.embedder.embed(text)).collect();
        let embeddings = stream::iter(pending)
            .buffered(self.concurrency)
            .collect::<Vec<_>>();

        let embeddings = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            embeddings = embeddings => embeddings,
        };

        let mut fallbacks = 0usize;
        let scores = embeddings
            .into_iter()
            .zip(candidates)
            .map(|(embedding, candidate)| match embedding {
                Ok(vector) if vector.len() == query_vector.len() => {
                    cosine_similarity(query_vector, &vector).max(0.0).min(1.0)
                }
                Ok(vector) => {
                    debug!(key = %candidate.key(), dimension = vector.len(), "Embedding dimension mismatch");
                    fallbacks += 1;
                    0.0
                }
                Err(e) => {
                    debug!(key = %candidate.key(), error = %e, "Candidate embedding failed");
                    fallbacks += 1;
                    0.0
                }
            })
            .collect();

        if fallbacks > 0 {
            warn!(fallbacks, "Scored candidates with zero vectors");
            metrics::record_embedding_fallback(fallbacks);
        }
        Ok(scores)
    }

    /// Score `new_candidates` against `question` and merge them into
    /// `previously_seen`. Recency is measured from `as_of`.
    #[instrument(skip_all, fields(new = new_candidates.len(), seen = previously_seen.len()))]
    pub async fn rank(
        &self,
        question: &str,
        as_of: NaiveDate,
        new_candidates: Vec<SourceCandidate>,
        previously_seen: &[SourceCandidate],
        cancel: &CancellationToken,
    ) -> Result<Ranking> {
        let seen: HashSet<CandidateKey> = previously_seen.iter().map(SourceCandidate::key).collect();
        let mut batch: HashSet<CandidateKey> = HashSet::new();
        let mut fresh: Vec<SourceCandidate> = new_candidates
            .into_iter()
            .filter(|c| !seen.contains(&c.key()) && batch.insert(c.key()))
            .take(self.max_candidates)
            .collect();

        let query_vector = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            vector = self.embedder.embed(question) => vector,
        };

        let scores = match query_vector {
            Ok(query_vector) => self.raw_scores(&query_vector, &fresh, cancel).await?,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, all candidates score zero");
                metrics::record_embedding_fallback(fresh.len());
                vec![0.0; fresh.len()]
            }
        };

        for (candidate, raw) in fresh.iter_mut().zip(scores) {
            let boosted = boosts::boosted(&self.ranking, candidate, raw, as_of);
            candidate.raw_score = Some(raw);
            candidate.boosted_score = Some(boosted);
        }
        fresh.sort_by(boosts::compare);

        let mut merged: Vec<SourceCandidate> = previously_seen.iter().chain(fresh.iter()).cloned().collect();
        merged.sort_by(boosts::compare);
        merged.truncate(self.top_n);

        debug!(scored = fresh.len(), top = merged.len(), "Ranking complete");
        Ok(Ranking {
            top_n: merged,
            newly_scored: fresh,
        })
    }
}
