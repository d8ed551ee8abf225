//! Quarry Research
//!
//! The query-time research engine:
//! - Tier routing (recall, direct, search-augmented, deep research)
//! - Round planning and parallel fetching across external sources
//! - Embedding-based ranking with credibility and recency boosts
//! - Reflection and stopping conditions for multi-round research
//! - Cited answer synthesis
//! - Event streaming and per-session cancellation

pub mod engine;
pub mod fetcher;
pub mod orchestrator;
pub mod planner;
pub mod ranker;
pub mod reflector;
pub mod registry;
pub mod router;
pub mod sources;
pub mod stopping;
pub mod streaming;
pub mod synthesis;

#[cfg(test)]
mod test_support;

pub use engine::{EngineOutcome, QueryEngine, QueryRequest};
pub use fetcher::{FetchResult, Fetcher, RoundConfig};
pub use orchestrator::{Orchestrator, ResearchOutcome};
pub use planner::Planner;
pub use ranker::{Ranker, Ranking};
pub use reflector::{FixedReflector, LlmReflector, Reflector};
pub use registry::{CancellationRegistry, RunGuard};
pub use router::{Routing, TierRouter};
pub use sources::{build_clients, SourceClient, SourceClients, StaticSourceClient};
pub use stopping::StoppingEvaluator;
pub use streaming::{completion_fallback, EventBus, StreamEmitter};
pub use synthesis::{AnswerSynthesizer, LlmSynthesizer, SynthesizedAnswer};
