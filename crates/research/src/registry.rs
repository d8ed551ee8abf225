//! Cancellation registry
//!
//! Maps running sessions to their cancellation tokens. An entry lives
//! exactly as long as the [`RunGuard`] returned by `register`.

use quarry_common::{AppError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Default)]
pub struct CancellationRegistry {
    running: Mutex<HashMap<Uuid, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, (u64, CancellationToken)>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a run. A session runs at most once at a time.
    pub fn register(self: &Arc<Self>, session_id: Uuid) -> Result<RunGuard> {
        let mut running = self.entries();
        if running.contains_key(&session_id) {
            return Err(AppError::Validation {
                message: format!("session {} already has a run in progress", session_id),
                field: Some("session_id".to_string()),
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        running.insert(session_id, (generation, token.clone()));

        Ok(RunGuard {
            registry: Arc::clone(self),
            session_id,
            generation,
            token,
        })
    }

    /// Cancel a running session. Returns false if nothing was running.
    pub fn cancel(&self, session_id: Uuid) -> bool {
        match self.entries().get(&session_id) {
            Some((_, token)) => {
                token.cancel();
                info!(%session_id, "Research run cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel everything (shutdown)
    pub fn cancel_all(&self) -> usize {
        let running = self.entries();
        for (_, token) in running.values() {
            token.cancel();
        }
        running.len()
    }

    pub fn is_running(&self, session_id: Uuid) -> bool {
        self.entries().contains_key(&session_id)
    }

    pub fn running_count(&self) -> usize {
        self.entries().len()
    }
}

/// Owns one registry entry; dropping it ends the run
pub struct RunGuard {
    registry: Arc<CancellationRegistry>,
    session_id: Uuid,
    generation: u64,
    token: CancellationToken,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = self.registry.entries();
        if running
            .get(&self.session_id)
            .is_some_and(|(generation, _)| *generation == self.generation)
        {
            running.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_removes_entry() {
        let registry = Arc::new(CancellationRegistry::new());
        let id = Uuid::new_v4();
        {
            let _guard = registry.register(id).unwrap();
            assert!(registry.is_running(id));
            assert!(registry.register(id).is_err());
        }
        assert!(!registry.is_running(id));
        assert!(!registry.cancel(id));
    }

    #[test]
    fn test_cancel_fires_token() {
        let registry = Arc::new(CancellationRegistry::new());
        let id = Uuid::new_v4();
        let guard = registry.register(id).unwrap();
        assert!(!guard.token().is_cancelled());
        assert!(registry.cancel(id));
        assert!(guard.token().is_cancelled());
    }

    #[test]
    fn test_cancel_all() {
        let registry = Arc::new(CancellationRegistry::new());
        let a = registry.register(Uuid::new_v4()).unwrap();
        let b = registry.register(Uuid::new_v4()).unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.token().is_cancelled() && b.token().is_cancelled());
        drop(a);
        assert_eq!(registry.running_count(), 1);
    }
}
