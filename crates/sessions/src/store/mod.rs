//! Session persistence
//!
//! Sessions are stored whole, keyed by id. All mutation goes through
//! [`SessionStore::update`], which applies a closure against the current
//! state so the invariants enforced by `ResearchSession` hold for every
//! backend.

mod memory;
mod redis;

pub use self::memory::InMemorySessionStore;
pub use self::redis::RedisSessionStore;

use async_trait::async_trait;
use quarry_common::config::StorageConfig;
use quarry_common::models::{
    CompletionTrigger, MessageRole, ReflectorVerdict, ResearchRound, ResearchSession,
    SessionMetadata,
};
use quarry_common::{AppError, Result};
use std::sync::Arc;
use uuid::Uuid;

/// Mutation applied to a stored session
pub type SessionUpdate = Box<dyn FnOnce(&mut ResearchSession) -> Result<()> + Send>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session. Fails if the id already exists.
    async fn insert(&self, session: ResearchSession) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<ResearchSession>;

    /// Apply `update` atomically with respect to other writers of this store
    async fn update(&self, id: Uuid, update: SessionUpdate) -> Result<ResearchSession>;

    /// Every session whose status is `Complete`
    async fn list_complete(&self) -> Result<Vec<ResearchSession>>;

    async fn list_active_ids(&self) -> Result<Vec<Uuid>>;

    /// Backend connectivity check
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn append_round(&self, id: Uuid, round: ResearchRound) -> Result<ResearchSession> {
        self.update(id, Box::new(move |s: &mut ResearchSession| s.append_round(round))).await
    }

    async fn record_verdict(&self, id: Uuid, verdict: ReflectorVerdict) -> Result<()> {
        self.update(id, Box::new(move |s: &mut ResearchSession| s.record_verdict(verdict)))
            .await
            .map(|_| ())
    }

    async fn append_message(&self, id: Uuid, role: MessageRole, content: String) -> Result<()> {
        self.update(id, Box::new(move |s: &mut ResearchSession| s.append_message(role, content)))
            .await
            .map(|_| ())
    }

    async fn mark_degraded(&self, id: Uuid) -> Result<()> {
        self.update(id, Box::new(|s: &mut ResearchSession| s.mark_degraded())).await.map(|_| ())
    }

    async fn complete(
        &self,
        id: Uuid,
        trigger: CompletionTrigger,
        metadata: SessionMetadata,
    ) -> Result<ResearchSession> {
        self.update(id, Box::new(move |s: &mut ResearchSession| s.complete(trigger, metadata)))
            .await
    }
}

pub(crate) fn not_found(id: Uuid) -> AppError {
    AppError::SessionNotFound { id: id.to_string() }
}

/// Build the configured session store
pub async fn create_store(config: &StorageConfig) -> Result<Arc<dyn SessionStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemorySessionStore::new())),
        "redis" => Ok(Arc::new(RedisSessionStore::connect(&config.redis).await?)),
        other => Err(AppError::Configuration {
            message: format!("unknown storage backend '{}'", other),
        }),
    }
}
