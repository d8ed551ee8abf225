//! Configuration management for Quarry services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values
//!
//! Research policy numbers (round caps, source thresholds, per-tier totals)
//! are deployment policy and live here rather than in code.

use crate::models::SourceType;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Text generation (synthesis, reflection, summaries)
    #[serde(default)]
    pub llm: LlmConfig,

    /// External knowledge sources
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Research loop policy
    #[serde(default)]
    pub research: ResearchConfig,

    /// Ranking multipliers
    #[serde(default)]
    pub ranking: RankingConfig,

    /// Session lifecycle triggers
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Recall search
    #[serde(default)]
    pub recall: RecallConfig,

    /// Session storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Generation provider: openai, mock
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Chat completions endpoint
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    pub api_key: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_synthesis_max_tokens")]
    pub synthesis_max_tokens: usize,

    #[serde(default = "default_synthesis_temperature")]
    pub synthesis_temperature: f32,

    /// Low temperature keeps reflector verdicts stable
    #[serde(default = "default_reflector_temperature")]
    pub reflector_temperature: f32,
}

/// One external source endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceEndpointConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// JSON search endpoint; a source without one is skipped
    pub endpoint: Option<String>,

    pub api_key: Option<String>,

    /// Per-source fetch timeout in milliseconds
    pub timeout_ms: u64,

    #[serde(default = "default_source_retries")]
    pub max_retries: u32,
}

impl SourceEndpointConfig {
    fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            enabled: true,
            endpoint: None,
            api_key: None,
            timeout_ms,
            max_retries: default_source_retries(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    #[serde(default = "default_web_source")]
    pub web: SourceEndpointConfig,

    #[serde(default = "default_literature_source")]
    pub literature: SourceEndpointConfig,

    #[serde(default = "default_preprint_source")]
    pub preprint: SourceEndpointConfig,

    #[serde(default = "default_clinical_trials_source")]
    pub clinical_trials: SourceEndpointConfig,
}

impl SourcesConfig {
    pub fn get(&self, source: SourceType) -> &SourceEndpointConfig {
        match source {
            SourceType::Web => &self.web,
            SourceType::Literature => &self.literature,
            SourceType::Preprint => &self.preprint,
            SourceType::ClinicalTrials => &self.clinical_trials,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResearchConfig {
    /// Hard cap on rounds per session
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Unique-source count at which research is considered comprehensive
    #[serde(default = "default_comprehensive_threshold")]
    pub comprehensive_threshold: usize,

    /// Session wall-clock budget in seconds
    #[serde(default = "default_wall_clock_budget")]
    pub wall_clock_budget_secs: u64,

    /// Upper bound for a single round's fan-out in seconds
    #[serde(default = "default_round_time_budget")]
    pub round_time_budget_secs: u64,

    /// Total candidates requested by the first deep-research round
    #[serde(default = "default_first_round_total")]
    pub first_round_total: usize,

    /// Total candidates requested by later deep-research rounds
    #[serde(default = "default_followup_round_total")]
    pub followup_round_total: usize,

    /// Total candidates requested by the single search-augmented round
    #[serde(default = "default_search_augmented_total")]
    pub search_augmented_total: usize,

    /// Ranked candidates kept per round
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// New candidates considered per ranking pass
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Snippet characters fed to the embedder
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,

    /// Concurrent embedding requests per ranking pass
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,
}

impl ResearchConfig {
    pub fn wall_clock_budget(&self) -> Duration {
        Duration::from_secs(self.wall_clock_budget_secs)
    }

    pub fn round_time_budget(&self) -> Duration {
        Duration::from_secs(self.round_time_budget_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RankingConfig {
    #[serde(default = "default_literature_boost")]
    pub literature_boost: f32,

    #[serde(default = "default_clinical_trials_boost")]
    pub clinical_trials_boost: f32,

    #[serde(default = "default_preprint_boost")]
    pub preprint_boost: f32,

    #[serde(default = "default_web_boost")]
    pub web_boost: f32,

    /// Published within the last year
    #[serde(default = "default_recent_boost")]
    pub recent_boost: f32,

    /// Published within the last three years
    #[serde(default = "default_moderately_recent_boost")]
    pub moderately_recent_boost: f32,
}

impl RankingConfig {
    /// Credibility multiplier, never below 1.0 so boosts cannot penalize
    pub fn credibility(&self, source: SourceType) -> f32 {
        let boost = match source {
            SourceType::Literature => self.literature_boost,
            SourceType::ClinicalTrials => self.clinical_trials_boost,
            SourceType::Preprint => self.preprint_boost,
            SourceType::Web => self.web_boost,
        };
        boost.max(1.0)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LifecycleConfig {
    /// Seconds without a user message before a session auto-completes
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,

    /// Keyword overlap below which a message counts as a topic shift
    #[serde(default = "default_topic_shift_threshold")]
    pub topic_shift_threshold: f32,

    /// Minimum keywords on both sides before topic shift is evaluated
    #[serde(default = "default_min_topic_keywords")]
    pub min_topic_keywords: usize,

    /// Bound on metadata generation at completion
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
}

impl LifecycleConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecallConfig {
    #[serde(default = "default_recall_limit")]
    pub default_limit: usize,

    /// Matches scoring below this are dropped
    #[serde(default = "default_recall_min_score")]
    pub min_score: f32,

    /// Lead the top match needs over the runner-up to be answered directly
    #[serde(default = "default_disambiguation_margin")]
    pub disambiguation_margin: f32,

    #[serde(default = "default_recall_answer_timeout")]
    pub answer_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Session store backend: memory, redis
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key namespace
    #[serde(default = "default_redis_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_concurrent() -> usize { 100 }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { crate::DEFAULT_EMBEDDING_MODEL.to_string() }
fn default_embedding_dimension() -> usize { crate::DEFAULT_EMBEDDING_DIMENSION }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_llm_provider() -> String { "openai".to_string() }
fn default_llm_endpoint() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 45 }
fn default_synthesis_max_tokens() -> usize { 1500 }
fn default_synthesis_temperature() -> f32 { 0.3 }
fn default_reflector_temperature() -> f32 { 0.1 }
fn default_source_retries() -> u32 { 2 }
fn default_web_source() -> SourceEndpointConfig { SourceEndpointConfig::with_timeout(10_000) }
fn default_literature_source() -> SourceEndpointConfig { SourceEndpointConfig::with_timeout(15_000) }
fn default_preprint_source() -> SourceEndpointConfig { SourceEndpointConfig::with_timeout(12_000) }
fn default_clinical_trials_source() -> SourceEndpointConfig { SourceEndpointConfig::with_timeout(15_000) }
fn default_max_rounds() -> u32 { 5 }
fn default_comprehensive_threshold() -> usize { 50 }
fn default_wall_clock_budget() -> u64 { 180 }
fn default_round_time_budget() -> u64 { 20 }
fn default_first_round_total() -> usize { 25 }
fn default_followup_round_total() -> usize { 15 }
fn default_search_augmented_total() -> usize { 10 }
fn default_top_n() -> usize { 30 }
fn default_max_candidates() -> usize { 60 }
fn default_snippet_chars() -> usize { 2000 }
fn default_embed_concurrency() -> usize { 16 }
fn default_literature_boost() -> f32 { 1.15 }
fn default_clinical_trials_boost() -> f32 { 1.15 }
fn default_preprint_boost() -> f32 { 1.05 }
fn default_web_boost() -> f32 { 1.0 }
fn default_recent_boost() -> f32 { 1.10 }
fn default_moderately_recent_boost() -> f32 { 1.05 }
fn default_inactivity_timeout() -> u64 { 600 }
fn default_topic_shift_threshold() -> f32 { 0.2 }
fn default_min_topic_keywords() -> usize { 3 }
fn default_metadata_timeout() -> u64 { 20 }
fn default_recall_limit() -> usize { 5 }
fn default_recall_min_score() -> f32 { 0.3 }
fn default_disambiguation_margin() -> f32 { 0.1 }
fn default_recall_answer_timeout() -> u64 { 30 }
fn default_storage_backend() -> String { "memory".to_string() }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_redis_prefix() -> String { "quarry".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "quarry".to_string() }
fn default_rate_limit() -> u32 { 20 }
fn default_burst() -> u32 { 40 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__RESEARCH__MAX_ROUNDS=4
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Grace period for open connections after a shutdown signal
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            endpoint: default_llm_endpoint(),
            api_key: None,
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            synthesis_max_tokens: default_synthesis_max_tokens(),
            synthesis_temperature: default_synthesis_temperature(),
            reflector_temperature: default_reflector_temperature(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            web: default_web_source(),
            literature: default_literature_source(),
            preprint: default_preprint_source(),
            clinical_trials: default_clinical_trials_source(),
        }
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            comprehensive_threshold: default_comprehensive_threshold(),
            wall_clock_budget_secs: default_wall_clock_budget(),
            round_time_budget_secs: default_round_time_budget(),
            first_round_total: default_first_round_total(),
            followup_round_total: default_followup_round_total(),
            search_augmented_total: default_search_augmented_total(),
            top_n: default_top_n(),
            max_candidates: default_max_candidates(),
            snippet_chars: default_snippet_chars(),
            embed_concurrency: default_embed_concurrency(),
        }
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            literature_boost: default_literature_boost(),
            clinical_trials_boost: default_clinical_trials_boost(),
            preprint_boost: default_preprint_boost(),
            web_boost: default_web_boost(),
            recent_boost: default_recent_boost(),
            moderately_recent_boost: default_moderately_recent_boost(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout(),
            topic_shift_threshold: default_topic_shift_threshold(),
            min_topic_keywords: default_min_topic_keywords(),
            metadata_timeout_secs: default_metadata_timeout(),
        }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_limit: default_recall_limit(),
            min_score: default_recall_min_score(),
            disambiguation_margin: default_disambiguation_margin(),
            answer_timeout_secs: default_recall_answer_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_redis_prefix(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.research.max_rounds, 5);
        assert_eq!(config.research.top_n, 30);
        assert_eq!(config.sources.web.timeout_ms, 10_000);
        assert_eq!(config.sources.get(SourceType::Literature).timeout_ms, 15_000);
    }

    #[test]
    fn test_credibility_never_penalizes() {
        let ranking = RankingConfig {
            web_boost: 0.5,
            ..RankingConfig::default()
        };
        assert_eq!(ranking.credibility(SourceType::Web), 1.0);
        assert!((ranking.credibility(SourceType::Literature) - 1.15).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "research": { "max_rounds": 3 },
            "sources": { "web": { "timeout_ms": 8000, "endpoint": "http://web" } }
        }))
        .unwrap();
        assert_eq!(config.research.max_rounds, 3);
        assert_eq!(config.research.comprehensive_threshold, 50);
        assert_eq!(config.sources.web.timeout_ms, 8000);
        assert!(config.sources.web.enabled);
        assert_eq!(config.sources.preprint.timeout_ms, 12_000);
    }
}
