//! Quarry Sessions
//!
//! Persistence and lifecycle for research sessions:
//! - Session store (in-memory and Redis backends)
//! - Lifecycle monitor: satisfaction, new-topic, topic-shift, inactivity
//!   and host-signal completion triggers
//! - One-shot metadata generation at completion
//! - Recall search over completed sessions

pub mod lifecycle;
pub mod metadata;
pub mod recall;
pub mod store;

pub use lifecycle::LifecycleMonitor;
pub use metadata::MetadataGenerator;
pub use recall::{RecallField, RecallMatch, RecallOutcome, RecallSearch};
pub use store::{create_store, InMemorySessionStore, RedisSessionStore, SessionStore};
