//! Quarry Common Library
//!
//! Shared code for all Quarry crates including:
//! - Research data model (queries, candidates, rounds, sessions, stream events)
//! - Embedding client abstraction
//! - Text generation (LLM) abstraction with explicit timeouts
//! - Error types and handling
//! - Configuration management
//! - Redis cache
//! - Metrics and observability

pub mod cache;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod text;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use llm::{GenerationRequest, Generator};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;
