//! Stopping-condition evaluator
//!
//! Research continues only while every ceiling holds and the reflector still
//! wants more. Any single violated condition stops the loop. Round and
//! source ceilings count only the current run, so every question asked in a
//! session gets the full allowance.

use quarry_common::config::ResearchConfig;
use quarry_common::models::{ReflectorVerdict, ResearchSession, StopReason, StoppingDecision};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoppingEvaluator {
    max_rounds: u32,
    comprehensive_threshold: usize,
    budget: Duration,
}

impl StoppingEvaluator {
    pub fn new(config: &ResearchConfig) -> Self {
        Self {
            max_rounds: config.max_rounds.max(1),
            comprehensive_threshold: config.comprehensive_threshold,
            budget: config.wall_clock_budget(),
        }
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Decide after a round of the run that started at `first_round`.
    ///
    /// The reason names the first violated condition, checked in the order
    /// round cap, source cap, time budget, reflector satisfied.
    pub fn should_continue(
        &self,
        session: &ResearchSession,
        first_round: u32,
        verdict: &ReflectorVerdict,
        elapsed: Duration,
    ) -> StoppingDecision {
        let run_rounds = session.rounds_since(first_round).len() as u32;
        let run_sources = session.sources_since(first_round).len();

        if run_rounds >= self.max_rounds {
            StoppingDecision::stop(StopReason::RoundCap)
        } else if run_sources >= self.comprehensive_threshold {
            StoppingDecision::stop(StopReason::SourceCap)
        } else if elapsed >= self.budget {
            StoppingDecision::stop(StopReason::TimeBudget)
        } else if verdict.sufficient {
            StoppingDecision::stop(StopReason::ReflectorSatisfied)
        } else {
            StoppingDecision::proceed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::models::{Query, ResearchRound, SourceCandidate, SourceType, Tier};
    use std::collections::BTreeMap;

    fn session_with(rounds: u32, sources: usize) -> ResearchSession {
        let mut s = ResearchSession::new(Query::new("statins", "en", "u1"), Tier::DeepResearch);
        let per_round = sources.div_ceil(rounds.max(1) as usize);
        let mut next = 0;
        for number in 1..=rounds {
            let take = per_round.min(sources - next);
            let fetched = (next..next + take)
                .map(|i| SourceCandidate::new(SourceType::Web, format!("w{i}"), "t", "s", "u"))
                .collect();
            next += take;
            s.append_round(ResearchRound {
                round_number: number,
                requested_counts: BTreeMap::new(),
                fetched_sources: fetched,
                ranked_top_n: Vec::new(),
                reflector_verdict: None,
                failures: Vec::new(),
            })
            .unwrap();
        }
        s
    }

    fn insufficient() -> ReflectorVerdict {
        ReflectorVerdict {
            sufficient: false,
            gaps: vec!["more".into()],
        }
    }

    fn evaluator() -> StoppingEvaluator {
        StoppingEvaluator::new(&ResearchConfig::default())
    }

    #[test]
    fn test_source_cap_overrides_reflector() {
        let session = session_with(3, 55);
        assert_eq!(session.unique_source_count(), 55);
        let decision = evaluator().should_continue(&session, 1, &insufficient(), Duration::from_secs(30));
        assert!(!decision.continue_research);
        assert_eq!(decision.reason, StopReason::SourceCap);
    }

    #[test]
    fn test_continues_when_all_conditions_hold() {
        let session = session_with(2, 20);
        let decision = evaluator().should_continue(&session, 1, &insufficient(), Duration::from_secs(30));
        assert_eq!(decision, StoppingDecision::proceed());
    }

    #[test]
    fn test_each_ceiling_stops() {
        let e = evaluator();
        let decision = e.should_continue(&session_with(5, 10), 1, &insufficient(), Duration::ZERO);
        assert_eq!(decision.reason, StopReason::RoundCap);

        let decision = e.should_continue(&session_with(1, 10), 1, &insufficient(), Duration::from_secs(180));
        assert_eq!(decision.reason, StopReason::TimeBudget);

        let satisfied = ReflectorVerdict {
            sufficient: true,
            gaps: vec![],
        };
        let decision = e.should_continue(&session_with(1, 10), 1, &satisfied, Duration::ZERO);
        assert_eq!(decision.reason, StopReason::ReflectorSatisfied);
    }

    #[test]
    fn test_round_cap_reported_first() {
        let decision = evaluator().should_continue(&session_with(5, 60), 1, &insufficient(), Duration::from_secs(999));
        assert_eq!(decision.reason, StopReason::RoundCap);
    }

    #[test]
    fn test_ceilings_count_only_the_current_run() {
        // five rounds and 60 sources from an earlier question
        let mut session = session_with(5, 60);
        let e = evaluator();
        assert_eq!(
            e.should_continue(&session, 1, &insufficient(), Duration::ZERO).reason,
            StopReason::RoundCap
        );

        let fetched = (55..65)
            .map(|i| SourceCandidate::new(SourceType::Web, format!("w{i}"), "t", "s", "u"))
            .collect();
        session
            .append_round(ResearchRound {
                round_number: 6,
                requested_counts: BTreeMap::new(),
                fetched_sources: fetched,
                ranked_top_n: Vec::new(),
                reflector_verdict: None,
                failures: Vec::new(),
            })
            .unwrap();

        let decision = e.should_continue(&session, 6, &insufficient(), Duration::ZERO);
        assert_eq!(decision, StoppingDecision::proceed());
    }
}
