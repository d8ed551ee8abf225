use super::{not_found, SessionStore, SessionUpdate};
use async_trait::async_trait;
use quarry_common::cache::{keys, Cache};
use quarry_common::config::RedisConfig;
use quarry_common::models::ResearchSession;
use quarry_common::{AppError, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Sessions stored as JSON documents under `{prefix}:session:{id}`, with
/// every id tracked in the `{prefix}:sessions` set.
pub struct RedisSessionStore {
    cache: Cache,
    // Serializes read-modify-write cycles issued from this process
    write_lock: Mutex<()>,
}

impl RedisSessionStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let cache = Cache::connect(config).await?;
        Ok(Self::new(cache))
    }

    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            write_lock: Mutex::new(()),
        }
    }

    async fn load_all(&self) -> Result<Vec<ResearchSession>> {
        let ids = self.cache.set_members(keys::session_index()).await?;
        let mut sessions = Vec::with_capacity(ids.len());

        for raw in ids {
            let Ok(id) = raw.parse::<Uuid>() else {
                warn!(member = %raw, "Skipping malformed session id in index");
                continue;
            };
            match self.cache.get::<ResearchSession>(&keys::session(id)).await? {
                Some(session) => sessions.push(session),
                None => debug!(session_id = %id, "Indexed session missing its document"),
            }
        }

        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn insert(&self, session: ResearchSession) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = keys::session(session.session_id);
        if self.cache.exists(&key).await? {
            return Err(AppError::InvariantViolation {
                message: format!("session {} already exists", session.session_id),
            });
        }
        self.cache.set(&key, &session).await?;
        self.cache
            .set_add(keys::session_index(), &session.session_id.to_string())
            .await
    }

    async fn get(&self, id: Uuid) -> Result<ResearchSession> {
        self.cache
            .get(&keys::session(id))
            .await?
            .ok_or_else(|| not_found(id))
    }

    async fn update(&self, id: Uuid, update: SessionUpdate) -> Result<ResearchSession> {
        let _guard = self.write_lock.lock().await;
        let mut session = self.get(id).await?;
        update(&mut session)?;
        self.cache.set(&keys::session(id), &session).await?;
        Ok(session)
    }

    async fn list_complete(&self) -> Result<Vec<ResearchSession>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|s| s.is_complete())
            .collect())
    }

    async fn list_active_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|s| s.is_active())
            .map(|s| s.session_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn ping(&self) -> Result<()> {
        self.cache.ping().await
    }
}
