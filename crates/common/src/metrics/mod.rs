//! Metrics and observability utilities
//!
//! Provides Prometheus metric descriptions and recording helpers for
//! research rounds, source fan-out, embeddings, generation, sessions and recall.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

pub const REQUESTS_TOTAL: &str = "quarry_requests_total";
pub const REQUEST_DURATION: &str = "quarry_request_duration_seconds";
pub const ROUNDS_TOTAL: &str = "quarry_rounds_total";
pub const ROUND_DURATION: &str = "quarry_round_duration_seconds";
pub const RESEARCH_STOPS_TOTAL: &str = "quarry_research_stops_total";
pub const SOURCE_FETCH_DURATION: &str = "quarry_source_fetch_duration_seconds";
pub const SOURCE_CANDIDATES_TOTAL: &str = "quarry_source_candidates_total";
pub const SOURCE_FAILURES_TOTAL: &str = "quarry_source_failures_total";
pub const EMBEDDING_REQUESTS_TOTAL: &str = "quarry_embedding_requests_total";
pub const EMBEDDING_DURATION: &str = "quarry_embedding_duration_seconds";
pub const EMBEDDING_FALLBACKS_TOTAL: &str = "quarry_embedding_fallbacks_total";
pub const GENERATION_REQUESTS_TOTAL: &str = "quarry_generation_requests_total";
pub const GENERATION_DURATION: &str = "quarry_generation_duration_seconds";
pub const SESSIONS_COMPLETED_TOTAL: &str = "quarry_sessions_completed_total";
pub const RECALL_SEARCHES_TOTAL: &str = "quarry_recall_searches_total";
pub const TIER_ROUTED_TOTAL: &str = "quarry_tier_routed_total";
pub const RATE_LIMITED_TOTAL: &str = "quarry_rate_limited_total";

/// Buckets for source and generation latency (seconds)
pub const SLOW_CALL_BUCKETS: &[f64] = &[
    0.100, 0.250, 0.500, 1.000, 2.000, 5.000, 10.00, 15.00, 30.00, 60.00,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(REQUESTS_TOTAL, Unit::Count, "Total number of HTTP requests");
    describe_histogram!(REQUEST_DURATION, Unit::Seconds, "HTTP request latency in seconds");

    describe_counter!(ROUNDS_TOTAL, Unit::Count, "Research rounds executed");
    describe_histogram!(ROUND_DURATION, Unit::Seconds, "Fetch and rank latency per round");
    describe_counter!(RESEARCH_STOPS_TOTAL, Unit::Count, "Research loops ended, by reason");

    describe_histogram!(SOURCE_FETCH_DURATION, Unit::Seconds, "Per-source fetch latency");
    describe_counter!(SOURCE_CANDIDATES_TOTAL, Unit::Count, "Candidates returned by sources");
    describe_counter!(SOURCE_FAILURES_TOTAL, Unit::Count, "Source fetch failures and timeouts");

    describe_counter!(EMBEDDING_REQUESTS_TOTAL, Unit::Count, "Total embedding API requests");
    describe_histogram!(EMBEDDING_DURATION, Unit::Seconds, "Embedding generation latency");
    describe_counter!(
        EMBEDDING_FALLBACKS_TOTAL,
        Unit::Count,
        "Candidates scored with a zero vector after an embedding failure"
    );

    describe_counter!(GENERATION_REQUESTS_TOTAL, Unit::Count, "Text generation calls");
    describe_histogram!(GENERATION_DURATION, Unit::Seconds, "Text generation latency");

    describe_counter!(SESSIONS_COMPLETED_TOTAL, Unit::Count, "Sessions completed, by trigger");
    describe_counter!(RECALL_SEARCHES_TOTAL, Unit::Count, "Recall searches, by outcome");
    describe_counter!(TIER_ROUTED_TOTAL, Unit::Count, "Queries routed, by tier");
    describe_counter!(RATE_LIMITED_TOTAL, Unit::Count, "Requests rejected by the rate limiter");

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            REQUESTS_TOTAL,
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            REQUEST_DURATION,
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_tier(tier: &str) {
    counter!(TIER_ROUTED_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Helper to record one completed fetch/rank round
pub fn record_round(tier: &str, duration_secs: f64, new_candidates: usize) {
    counter!(ROUNDS_TOTAL, "tier" => tier.to_string()).increment(1);
    histogram!(ROUND_DURATION, "tier" => tier.to_string()).record(duration_secs);
    tracing::debug!(tier, new_candidates, "Round recorded");
}

pub fn record_research_stop(reason: &str) {
    counter!(RESEARCH_STOPS_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Helper to record a single source's outcome within a round
pub fn record_source_fetch(source: &str, duration_secs: f64, candidates: usize, outcome: &str) {
    histogram!(SOURCE_FETCH_DURATION, "source" => source.to_string()).record(duration_secs);

    if outcome == "ok" {
        counter!(SOURCE_CANDIDATES_TOTAL, "source" => source.to_string())
            .increment(candidates as u64);
    } else {
        counter!(
            SOURCE_FAILURES_TOTAL,
            "source" => source.to_string(),
            "outcome" => outcome.to_string()
        )
        .increment(1);
    }
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        EMBEDDING_REQUESTS_TOTAL,
        "model" => model.to_string(),
        "status" => status
    )
    .increment(1);

    if success {
        histogram!(EMBEDDING_DURATION, "model" => model.to_string()).record(duration_secs);
    }
    tracing::trace!(model, batch_size, success, "Embedding call recorded");
}

pub fn record_embedding_fallback(count: usize) {
    counter!(EMBEDDING_FALLBACKS_TOTAL).increment(count as u64);
}

pub fn record_generation(model: &str, duration_secs: f64, outcome: &str) {
    counter!(
        GENERATION_REQUESTS_TOTAL,
        "model" => model.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(GENERATION_DURATION, "model" => model.to_string()).record(duration_secs);
}

pub fn record_session_completed(trigger: &str, with_metadata: bool) {
    counter!(
        SESSIONS_COMPLETED_TOTAL,
        "trigger" => trigger.to_string(),
        "metadata" => if with_metadata { "generated" } else { "empty" }
    )
    .increment(1);
}

pub fn record_recall(outcome: &str) {
    counter!(RECALL_SEARCHES_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_call_buckets_sorted() {
        let mut prev = 0.0;
        for &bucket in SLOW_CALL_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every helper must be a no-op
        let metrics = RequestMetrics::start("POST", "/v1/query");
        metrics.finish(200);
        record_round("deep_research", 1.2, 17);
        record_source_fetch("literature", 15.0, 0, "timeout");
        record_session_completed("inactivity", true);
    }
}
