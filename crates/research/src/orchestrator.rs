//! Research orchestrator
//!
//! Drives one session through Plan -> Fetch -> Rank -> Reflect -> Decide
//! until the stopping evaluator ends the loop, then synthesizes a cited
//! answer from the latest ranked corpus.
//!
//! Only fetch+rank produce a persisted round. Every suspension point races
//! the run's cancellation token; a cancelled run persists nothing further.

use crate::fetcher::Fetcher;
use crate::planner::Planner;
use crate::ranker::Ranker;
use crate::reflector::Reflector;
use crate::registry::CancellationRegistry;
use crate::stopping::StoppingEvaluator;
use crate::streaming::StreamEmitter;
use crate::synthesis::{AnswerSynthesizer, SynthesisInput};
use quarry_common::config::ResearchConfig;
use quarry_common::models::{
    CandidateKey, CitationRef, MessageRole, ResearchRound, ResearchSession, SourceCandidate, Stage,
    StopReason, Tier,
};
use quarry_common::{metrics, AppError, Result};
use quarry_sessions::SessionStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Sources listed when synthesis fails
const FALLBACK_SOURCES: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ResearchOutcome {
    pub session_id: Uuid,
    pub answer: String,
    pub citations: Vec<CitationRef>,
    pub degraded: bool,
    pub stop_reason: StopReason,
    /// Rounds run by this invocation
    pub rounds: usize,
}

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    fetcher: Fetcher,
    ranker: Ranker,
    planner: Planner,
    reflector: Arc<dyn Reflector>,
    stopping: StoppingEvaluator,
    synthesizer: Arc<dyn AnswerSynthesizer>,
    registry: Arc<CancellationRegistry>,
    budget: Duration,
}

async fn or_cancel<T>(cancel: &CancellationToken, future: impl std::future::Future<Output = T>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        value = future => Ok(value),
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        fetcher: Fetcher,
        ranker: Ranker,
        reflector: Arc<dyn Reflector>,
        synthesizer: Arc<dyn AnswerSynthesizer>,
        registry: Arc<CancellationRegistry>,
        research: &ResearchConfig,
    ) -> Self {
        let planner = Planner::new(research.clone(), fetcher.available());
        Self {
            store,
            fetcher,
            ranker,
            planner,
            reflector,
            stopping: StoppingEvaluator::new(research),
            synthesizer,
            registry,
            budget: research.wall_clock_budget(),
        }
    }

    /// Research the session's current question at `tier`
    #[instrument(skip_all, fields(session_id = %session_id, tier = %tier))]
    pub async fn run(&self, session_id: Uuid, tier: Tier, emitter: &StreamEmitter) -> Result<ResearchOutcome> {
        let guard = self.registry.register(session_id)?;
        let cancel = guard.token().clone();
        let started = Instant::now();
        let mut rounds = 0usize;

        let result = match self.research_loop(session_id, tier, emitter, &cancel, started, &mut rounds).await {
            Ok(stop_reason) => self.synthesize(session_id, stop_reason, rounds, emitter, &cancel).await,
            Err(e) => Err(e),
        };
        drop(guard);

        match result {
            Err(AppError::Cancelled) => {
                info!(rounds, "Research cancelled");
                metrics::record_research_stop(StopReason::Cancelled.as_str());
                Ok(ResearchOutcome {
                    session_id,
                    answer: "Research was cancelled before an answer was written.".to_string(),
                    citations: Vec::new(),
                    degraded: true,
                    stop_reason: StopReason::Cancelled,
                    rounds,
                })
            }
            other => other,
        }
    }

    async fn research_loop(
        &self,
        session_id: Uuid,
        tier: Tier,
        emitter: &StreamEmitter,
        cancel: &CancellationToken,
        started: Instant,
        rounds: &mut usize,
    ) -> Result<StopReason> {
        // Earlier rounds belong to questions already answered in this session
        let first_round = self.store.get(session_id).await?.next_round_number();

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let session = self.store.get(session_id).await?;
            let round_number = session.next_round_number();
            let round_started = Instant::now();

            emitter.stage(Stage::Planning, Some(round_number), "Planning round");
            let mut config = self.planner.plan(&session, round_number, first_round, tier);
            config.time_budget = config
                .time_budget
                .min(self.budget.saturating_sub(started.elapsed()));

            emitter.stage(
                Stage::Fetching,
                Some(round_number),
                format!("Querying {} sources for {} results", config.requested_counts.len(), config.total),
            );
            let fetched = self.fetcher.fetch(&config, cancel).await?;
            let outage = fetched.is_total_outage();
            let failures = fetched.failures();

            emitter.stage(
                Stage::Ranking,
                Some(round_number),
                format!("Ranking {} candidates", fetched.candidates.len()),
            );
            let (fetched_sources, ranked_top_n) = if outage {
                let previous = session
                    .rounds_since(first_round)
                    .last()
                    .map(|r| r.ranked_top_n.clone())
                    .unwrap_or_default();
                (Vec::new(), previous)
            } else {
                let ranking = self
                    .ranker
                    .rank(
                        session.current_question(),
                        session.current_question_date(),
                        fetched.candidates,
                        &session.sources_since(first_round),
                        cancel,
                    )
                    .await?;
                (ranking.newly_scored, ranking.top_n)
            };

            let new_candidates = fetched_sources.len();
            let session = self
                .store
                .append_round(
                    session_id,
                    ResearchRound {
                        round_number,
                        requested_counts: config.requested_counts,
                        fetched_sources,
                        ranked_top_n,
                        reflector_verdict: None,
                        failures,
                    },
                )
                .await?;
            *rounds += 1;
            metrics::record_round(tier.as_str(), round_started.elapsed().as_secs_f64(), new_candidates);
            info!(
                round_number,
                new_candidates,
                unique_sources = session.unique_source_count(),
                "Round persisted"
            );

            if outage {
                warn!(round_number, error = %AppError::TotalSourceOutage { round: round_number }, "Ending research early");
                self.store.mark_degraded(session_id).await?;
                return Ok(StopReason::SourceOutage);
            }
            if tier != Tier::DeepResearch {
                return Ok(StopReason::SingleRound);
            }

            emitter.stage(Stage::Reflecting, Some(round_number), "Reviewing coverage");
            let verdict = or_cancel(cancel, self.reflector.reflect(&session)).await?;
            self.store.record_verdict(session_id, verdict.clone()).await?;

            emitter.stage(Stage::Deciding, Some(round_number), "Deciding whether to continue");
            let decision = self
                .stopping
                .should_continue(&session, first_round, &verdict, started.elapsed());
            if !decision.continue_research {
                return Ok(decision.reason);
            }
        }
    }

    /// Map synthesizer citations onto the corpus, dropping any key the
    /// session never saw.
    fn resolve_citations(session: &ResearchSession, citations: &[(usize, CandidateKey)]) -> Vec<CitationRef> {
        let corpus: HashMap<CandidateKey, &SourceCandidate> =
            session.corpus.iter().map(|c| (c.key(), c)).collect();

        citations
            .iter()
            .filter_map(|(index, key)| match corpus.get(key) {
                Some(candidate) => Some(CitationRef::from_candidate(*index, candidate)),
                None => {
                    let violation = AppError::InvariantViolation {
                        message: format!("answer cited {} which is not in the session corpus", key),
                    };
                    warn!(error = %violation, "Dropping citation");
                    None
                }
            })
            .collect()
    }

    fn fallback_answer(sources: &[SourceCandidate]) -> (String, Vec<CitationRef>) {
        if sources.is_empty() {
            return (
                "No sources could be retrieved for this question, so no answer could be written.".to_string(),
                Vec::new(),
            );
        }

        let mut answer = String::from("An answer could not be written. The most relevant sources found were:\n");
        let mut citations = Vec::new();
        for (i, source) in sources.iter().take(FALLBACK_SOURCES).enumerate() {
            answer.push_str(&format!("[{}] {} ({})\n", i + 1, source.title, source.url));
            citations.push(CitationRef::from_candidate(i + 1, source));
        }
        (answer, citations)
    }

    async fn synthesize(
        &self,
        session_id: Uuid,
        stop_reason: StopReason,
        rounds: usize,
        emitter: &StreamEmitter,
        cancel: &CancellationToken,
    ) -> Result<ResearchOutcome> {
        emitter.stage(Stage::Synthesizing, None, "Writing answer");
        let session = self.store.get(session_id).await?;
        let sources = session
            .latest_round()
            .map(|r| r.ranked_top_n.as_slice())
            .unwrap_or_default();
        let mut degraded = session.degraded;

        let on_token = |token: &str| emitter.token(token);
        let input = SynthesisInput {
            question: session.current_question(),
            sources,
            rounds,
            degraded,
        };
        let synthesized = or_cancel(cancel, self.synthesizer.synthesize(input, &on_token)).await?;

        let (answer, citations) = match synthesized {
            Ok(synthesized) => {
                let cited: Vec<(usize, CandidateKey)> = synthesized
                    .citations
                    .into_iter()
                    .map(|c| (c.index, c.key))
                    .collect();
                (synthesized.answer, Self::resolve_citations(&session, &cited))
            }
            Err(e) => {
                warn!(error = %e, "Synthesis failed, answering with a source list");
                degraded = true;
                let (answer, citations) = Self::fallback_answer(sources);
                emitter.token(&answer);
                (answer, citations)
            }
        };
        emitter.citations(&citations);

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.store
            .append_message(session_id, MessageRole::Assistant, answer.clone())
            .await?;
        if degraded && !session.degraded {
            self.store.mark_degraded(session_id).await?;
        }

        metrics::record_research_stop(stop_reason.as_str());
        info!(
            stop_reason = stop_reason.as_str(),
            rounds,
            citations = citations.len(),
            degraded,
            "Research complete"
        );

        Ok(ResearchOutcome {
            session_id,
            answer,
            citations,
            degraded,
            stop_reason,
            rounds,
        })
    }
}
