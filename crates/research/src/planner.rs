//! Round planner
//!
//! Decides how many candidates each source contributes to a round. The split
//! starts from base weights, is scaled toward sources whose cue words appear
//! in the question (and, after a run's first round, in the reflector's gaps), and is
//! apportioned so the counts always sum to the round total.

use crate::fetcher::RoundConfig;
use quarry_common::config::ResearchConfig;
use quarry_common::models::{ResearchSession, SourceType, Tier};
use quarry_common::text;
use std::collections::BTreeMap;
use tracing::debug;

const WEB_CUES: &[&str] = &[
    "news", "price", "prices", "cost", "guide", "company", "companies", "policy",
    "announcement", "today", "product", "review", "reviews", "how-to",
];

const LITERATURE_CUES: &[&str] = &[
    "study", "studies", "evidence", "peer-reviewed", "journal", "meta-analysis",
    "systematic", "mechanism", "efficacy", "cohort", "literature", "published",
    "pathophysiology", "epidemiology",
];

const PREPRINT_CUES: &[&str] = &[
    "preprint", "preprints", "arxiv", "biorxiv", "medrxiv", "emerging", "cutting-edge",
    "novel", "unpublished", "latest",
];

const CLINICAL_TRIAL_CUES: &[&str] = &[
    "trial", "trials", "clinical", "phase", "randomized", "rct", "placebo", "dose",
    "dosage", "patients", "recruiting", "drug", "therapy", "treatment",
];

/// Weight multiplier per cue hit, capped at three hits
const CUE_SCALE: f64 = 0.5;
const MAX_CUE_HITS: usize = 3;

fn base_weight(source: SourceType) -> f64 {
    match source {
        SourceType::Web => 0.40,
        SourceType::Literature => 0.32,
        SourceType::Preprint => 0.12,
        SourceType::ClinicalTrials => 0.16,
    }
}

fn cues(source: SourceType) -> &'static [&'static str] {
    match source {
        SourceType::Web => WEB_CUES,
        SourceType::Literature => LITERATURE_CUES,
        SourceType::Preprint => PREPRINT_CUES,
        SourceType::ClinicalTrials => CLINICAL_TRIAL_CUES,
    }
}

/// Largest-remainder apportionment of `total` across `weights`.
///
/// Non-positive weights receive nothing unless every weight is non-positive,
/// in which case the total is split evenly. Remainder ties go to the earlier
/// source type. The result always sums to `total` when `weights` is non-empty.
pub fn apportion(weights: &BTreeMap<SourceType, f64>, total: usize) -> BTreeMap<SourceType, usize> {
    if weights.is_empty() {
        return BTreeMap::new();
    }

    let positive: f64 = weights.values().filter(|w| **w > 0.0).sum();
    let shares: Vec<(SourceType, f64)> = weights
        .iter()
        .map(|(source, w)| {
            let share = if positive > 0.0 {
                w.max(0.0) / positive
            } else {
                1.0 / weights.len() as f64
            };
            (*source, share * total as f64)
        })
        .collect();

    let mut counts: BTreeMap<SourceType, usize> = shares
        .iter()
        .map(|(source, quota)| (*source, quota.floor() as usize))
        .collect();
    let assigned: usize = counts.values().sum();

    let mut remainders: Vec<(SourceType, f64)> = shares
        .iter()
        .map(|(source, quota)| (*source, quota - quota.floor()))
        .collect();
    remainders.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    for (source, _) in remainders.iter().cycle().take(total.saturating_sub(assigned)) {
        *counts.entry(*source).or_default() += 1;
    }

    counts
}

/// Force `counts` to sum to `total`, re-apportioning proportionally if not
pub fn reconcile(counts: BTreeMap<SourceType, usize>, total: usize) -> BTreeMap<SourceType, usize> {
    if counts.values().sum::<usize>() == total {
        return counts;
    }
    let weights = counts.iter().map(|(s, c)| (*s, *c as f64)).collect();
    apportion(&weights, total)
}

pub struct Planner {
    research: ResearchConfig,
    available: Vec<SourceType>,
}

impl Planner {
    /// `available` lists the source types with a configured client; an
    /// empty list plans across every type.
    pub fn new(research: ResearchConfig, available: Vec<SourceType>) -> Self {
        let available = if available.is_empty() {
            SourceType::ALL.to_vec()
        } else {
            available
        };
        Self { research, available }
    }

    fn round_total(&self, run_round: u32, tier: Tier) -> usize {
        match tier {
            Tier::SearchAugmented => self.research.search_augmented_total,
            _ if run_round <= 1 => self.research.first_round_total,
            _ => self.research.followup_round_total,
        }
    }

    /// Cue-adjusted weights for the available sources
    pub fn weights(&self, search_text: &str) -> BTreeMap<SourceType, f64> {
        let words = text::keyword_set(search_text);
        self.available
            .iter()
            .map(|source| {
                let hits = cues(*source)
                    .iter()
                    .filter(|cue| words.contains(**cue))
                    .count()
                    .min(MAX_CUE_HITS);
                (*source, base_weight(*source) * (1.0 + CUE_SCALE * hits as f64))
            })
            .collect()
    }

    /// Plan round `round_number` of a run that started at `first_round`.
    ///
    /// Round totals and gap carry-over are counted from the run's first
    /// round, so a follow-up question starts from the first-round total.
    pub fn plan(&self, session: &ResearchSession, round_number: u32, first_round: u32, tier: Tier) -> RoundConfig {
        let question = session.current_question();
        let run_round = round_number.saturating_sub(first_round) + 1;
        let gaps: Vec<&str> = if run_round > 1 {
            session
                .latest_round()
                .and_then(|r| r.reflector_verdict.as_ref())
                .map(|v| v.gaps.iter().map(String::as_str).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let search_text = if gaps.is_empty() {
            question.to_string()
        } else {
            format!("{} {}", question, gaps.join(" "))
        };

        let total = self.round_total(run_round, tier);
        let counts = reconcile(apportion(&self.weights(&search_text), total), total);

        debug!(
            session_id = %session.session_id,
            round_number,
            run_round,
            total,
            ?counts,
            "Round planned"
        );

        RoundConfig {
            round_number,
            search_text,
            requested_counts: counts,
            total,
            time_budget: self.research.round_time_budget(),
        }
    }
}
