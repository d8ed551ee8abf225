use super::{not_found, SessionStore, SessionUpdate};
use async_trait::async_trait;
use quarry_common::models::ResearchSession;
use quarry_common::{AppError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Process-local store; state is lost on restart
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, ResearchSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: ResearchSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(AppError::InvariantViolation {
                message: format!("session {} already exists", session.session_id),
            });
        }
        sessions.insert(session.session_id, session);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<ResearchSession> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn update(&self, id: Uuid, update: SessionUpdate) -> Result<ResearchSession> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions.get_mut(&id).ok_or_else(|| not_found(id))?;

        // Apply to a copy so a rejected update leaves nothing half-written
        let mut next = stored.clone();
        update(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn list_complete(&self) -> Result<Vec<ResearchSession>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_complete())
            .cloned()
            .collect())
    }

    async fn list_active_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_active())
            .map(|s| s.session_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::models::{
        CompletionTrigger, MessageRole, Query, ResearchRound, SessionMetadata, SourceCandidate,
        SourceType, Tier,
    };
    use std::collections::BTreeMap;

    fn new_session() -> ResearchSession {
        ResearchSession::new(Query::new("statins", "en", "u1"), Tier::DeepResearch)
    }

    fn round(number: u32, ids: &[&str]) -> ResearchRound {
        ResearchRound {
            round_number: number,
            requested_counts: BTreeMap::new(),
            fetched_sources: ids
                .iter()
                .map(|id| SourceCandidate::new(SourceType::Literature, *id, "t", "s", "u"))
                .collect(),
            ranked_top_n: Vec::new(),
            reflector_verdict: None,
            failures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemorySessionStore::new();
        let session = new_session();
        let id = session.session_id;
        store.insert(session.clone()).await.unwrap();
        assert!(store.insert(session).await.is_err());
        assert_eq!(store.get(id).await.unwrap().session_id, id);
        assert!(matches!(
            store.get(Uuid::new_v4()).await,
            Err(AppError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_state_unchanged() {
        let store = InMemorySessionStore::new();
        let session = new_session();
        let id = session.session_id;
        store.insert(session).await.unwrap();

        store.append_round(id, round(1, &["a", "b"])).await.unwrap();
        assert!(store.append_round(id, round(3, &["c"])).await.is_err());

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.rounds.len(), 1);
        assert_eq!(stored.unique_source_count(), 2);
    }

    #[tokio::test]
    async fn test_completed_sessions_listed_and_closed() {
        let store = InMemorySessionStore::new();
        let a = new_session();
        let b = new_session();
        let (a_id, b_id) = (a.session_id, b.session_id);
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        store
            .complete(a_id, CompletionTrigger::Explicit, SessionMetadata::default())
            .await
            .unwrap();

        let complete = store.list_complete().await.unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].session_id, a_id);
        assert_eq!(store.list_active_ids().await.unwrap(), vec![b_id]);

        let err = store
            .append_message(a_id, MessageRole::User, "more".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SessionClosed { .. }));
    }
}
