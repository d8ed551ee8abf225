//! Parallel fetcher
//!
//! Fans a round out to every requested source concurrently. Each source runs
//! under its own timeout; failures and timeouts are recorded on the result
//! and never abort the round. Results are merged in `SourceType` order no
//! matter which source answered first.

use crate::planner;
use crate::sources::SourceClients;
use futures::future::join_all;
use quarry_common::config::SourcesConfig;
use quarry_common::models::{CandidateKey, SourceCandidate, SourceFailure, SourceType};
use quarry_common::{metrics, AppError, Result};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// What one round asks of the sources
#[derive(Debug, Clone, PartialEq)]
pub struct RoundConfig {
    pub round_number: u32,
    pub search_text: String,
    pub requested_counts: BTreeMap<SourceType, usize>,
    /// Required sum of `requested_counts`
    pub total: usize,
    /// Upper bound on any single source call this round
    pub time_budget: Duration,
}

#[derive(Debug, Clone)]
pub struct SourceOutcome {
    pub source_type: SourceType,
    pub requested: usize,
    pub returned: usize,
    pub elapsed: Duration,
    pub failure: Option<SourceFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Merged candidates, `SourceType` order, in-batch duplicates removed
    pub candidates: Vec<SourceCandidate>,
    pub outcomes: Vec<SourceOutcome>,
}

impl FetchResult {
    pub fn failures(&self) -> Vec<SourceFailure> {
        self.outcomes.iter().filter_map(|o| o.failure.clone()).collect()
    }

    /// Nothing came back from any source
    pub fn is_total_outage(&self) -> bool {
        self.candidates.is_empty()
    }
}

pub struct Fetcher {
    clients: SourceClients,
    sources: SourcesConfig,
}

impl Fetcher {
    pub fn new(clients: SourceClients, sources: SourcesConfig) -> Self {
        Self { clients, sources }
    }

    /// Source types with a client
    pub fn available(&self) -> Vec<SourceType> {
        self.clients.keys().copied().collect()
    }

    fn timeout_for(&self, source: SourceType, budget: Duration) -> Duration {
        self.sources.get(source).timeout().min(budget)
    }

    async fn fetch_one(
        &self,
        source: SourceType,
        query: &str,
        count: usize,
        budget: Duration,
    ) -> (Vec<SourceCandidate>, SourceOutcome) {
        let started = Instant::now();
        let timeout = self.timeout_for(source, budget);

        let result = match self.clients.get(&source) {
            Some(client) => match tokio::time::timeout(timeout, client.fetch(query, count, timeout)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::SourceTimeout {
                    source_type: source.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
            None => Err(AppError::SourceUnavailable {
                source_type: source.to_string(),
                message: "no client configured".to_string(),
            }),
        };

        let elapsed = started.elapsed();
        match result {
            Ok(mut candidates) => {
                candidates.truncate(count);
                metrics::record_source_fetch(source.as_str(), elapsed.as_secs_f64(), candidates.len(), "ok");
                let outcome = SourceOutcome {
                    source_type: source,
                    requested: count,
                    returned: candidates.len(),
                    elapsed,
                    failure: None,
                };
                (candidates, outcome)
            }
            Err(e) => {
                let timed_out = matches!(e, AppError::SourceTimeout { .. });
                warn!(source = %source, timed_out, error = %e, "Source fetch failed");
                metrics::record_source_fetch(
                    source.as_str(),
                    elapsed.as_secs_f64(),
                    0,
                    if timed_out { "timeout" } else { "error" },
                );
                let outcome = SourceOutcome {
                    source_type: source,
                    requested: count,
                    returned: 0,
                    elapsed,
                    failure: Some(SourceFailure {
                        source_type: source,
                        timed_out,
                        message: e.to_string(),
                    }),
                };
                (Vec::new(), outcome)
            }
        }
    }

    /// Run one round's fan-out. Returns `Cancelled` if `cancel` fires first.
    #[instrument(skip_all, fields(round = config.round_number, total = config.total))]
    pub async fn fetch(&self, config: &RoundConfig, cancel: &CancellationToken) -> Result<FetchResult> {
        let mut counts = config.requested_counts.clone();
        let requested: usize = counts.values().sum();
        if requested != config.total {
            let violation = AppError::InvariantViolation {
                message: format!(
                    "round {} requested {} candidates but the round total is {}",
                    config.round_number, requested, config.total
                ),
            };
            error!(error = %violation, "Rescaling requested counts");
            counts = planner::reconcile(counts, config.total);
        }

        let calls = counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(source, count)| self.fetch_one(*source, &config.search_text, *count, config.time_budget));

        let settled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            settled = join_all(calls) => settled,
        };

        let mut seen: HashSet<CandidateKey> = HashSet::new();
        let mut result = FetchResult::default();
        for (candidates, outcome) in settled {
            result
                .candidates
                .extend(candidates.into_iter().filter(|c| seen.insert(c.key())));
            result.outcomes.push(outcome);
        }

        info!(
            candidates = result.candidates.len(),
            failed = result.outcomes.iter().filter(|o| o.failure.is_some()).count(),
            "Round fetch settled"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{SourceClient, StaticSourceClient};
    use std::sync::Arc;

    fn config(counts: &[(SourceType, usize)], total: usize) -> RoundConfig {
        RoundConfig {
            round_number: 1,
            search_text: "statins dementia".into(),
            requested_counts: counts.iter().copied().collect(),
            total,
            time_budget: Duration::from_secs(20),
        }
    }

    fn scenario_clients(literature: StaticSourceClient) -> SourceClients {
        let mut clients: SourceClients = BTreeMap::new();
        clients.insert(SourceType::Web, Arc::new(StaticSourceClient::synthetic(SourceType::Web, "statins", 20)));
        clients.insert(SourceType::Literature, Arc::new(literature));
        clients.insert(
            SourceType::Preprint,
            Arc::new(StaticSourceClient::synthetic(SourceType::Preprint, "statins", 20)),
        );
        clients.insert(
            SourceType::ClinicalTrials,
            Arc::new(StaticSourceClient::synthetic(SourceType::ClinicalTrials, "statins", 20)),
        );
        clients
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out_without_failing_round() {
        let slow = StaticSourceClient::synthetic(SourceType::Literature, "statins", 20)
            .with_delay(Duration::from_secs(60));
        let fetcher = Fetcher::new(scenario_clients(slow), SourcesConfig::default());

        let result = fetcher
            .fetch(
                &config(
                    &[
                        (SourceType::Web, 10),
                        (SourceType::Literature, 8),
                        (SourceType::Preprint, 3),
                        (SourceType::ClinicalTrials, 4),
                    ],
                    25,
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.candidates.len(), 17);
        let failures = result.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].source_type, SourceType::Literature);
        assert!(failures[0].timed_out);

        let literature = result
            .outcomes
            .iter()
            .find(|o| o.source_type == SourceType::Literature)
            .unwrap();
        assert!(literature.elapsed >= Duration::from_secs(15));
        assert!(literature.elapsed < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_order_ignores_arrival_order() {
        let mut clients: SourceClients = BTreeMap::new();
        clients.insert(
            SourceType::Web,
            Arc::new(StaticSourceClient::synthetic(SourceType::Web, "a", 5).with_delay(Duration::from_secs(3))),
        );
        clients.insert(
            SourceType::ClinicalTrials,
            Arc::new(StaticSourceClient::synthetic(SourceType::ClinicalTrials, "a", 5)),
        );
        let fetcher = Fetcher::new(clients, SourcesConfig::default());

        let result = fetcher
            .fetch(
                &config(&[(SourceType::Web, 2), (SourceType::ClinicalTrials, 2)], 4),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let order: Vec<SourceType> = result.candidates.iter().map(|c| c.source_type).collect();
        assert_eq!(
            order,
            vec![SourceType::Web, SourceType::Web, SourceType::ClinicalTrials, SourceType::ClinicalTrials]
        );
    }

    #[tokio::test]
    async fn test_mismatched_counts_are_rescaled() {
        let web = Arc::new(StaticSourceClient::synthetic(SourceType::Web, "a", 50));
        let mut clients: SourceClients = BTreeMap::new();
        clients.insert(SourceType::Web, web.clone() as Arc<dyn SourceClient>);
        let fetcher = Fetcher::new(clients, SourcesConfig::default());

        let result = fetcher
            .fetch(&config(&[(SourceType::Web, 30)], 10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.candidates.len(), 10);
    }

    #[tokio::test]
    async fn test_duplicates_within_batch_removed() {
        let dup = SourceCandidate::new(SourceType::Web, "same", "t", "s", "u");
        let mut clients: SourceClients = BTreeMap::new();
        clients.insert(
            SourceType::Web,
            Arc::new(StaticSourceClient::new(SourceType::Web, vec![dup.clone(), dup])),
        );
        let fetcher = Fetcher::new(clients, SourcesConfig::default());

        let result = fetcher
            .fetch(&config(&[(SourceType::Web, 2)], 2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_total_outage_and_missing_clients() {
        let mut clients: SourceClients = BTreeMap::new();
        clients.insert(SourceType::Web, Arc::new(StaticSourceClient::failing(SourceType::Web, "503")));
        let fetcher = Fetcher::new(clients, SourcesConfig::default());

        let result = fetcher
            .fetch(
                &config(&[(SourceType::Web, 5), (SourceType::Literature, 5)], 10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.is_total_outage());
        assert_eq!(result.failures().len(), 2);
        assert!(result.failures().iter().all(|f| !f.timed_out));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_fan_out() {
        let slow = StaticSourceClient::synthetic(SourceType::Literature, "a", 5)
            .with_delay(Duration::from_secs(10));
        let fetcher = Fetcher::new(scenario_clients(slow), SourcesConfig::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = fetcher
            .fetch(&config(&[(SourceType::Literature, 5)], 5), &cancel)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }
}
