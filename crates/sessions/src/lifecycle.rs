//! Session lifecycle monitor
//!
//! Sessions move from active to complete exactly once. Independent triggers
//! race for that transition:
//! - explicit satisfaction ("thanks, that's all")
//! - explicit new-topic requests
//! - topic shift, measured as keyword overlap with the session's topics
//! - inactivity, via a per-session timer reset on every user message
//! - a host signal (backgrounding or termination) completing all sessions
//!
//! Metadata is generated best-effort at the transition; a failure still
//! completes the session, with empty metadata.

use crate::metadata::MetadataGenerator;
use crate::store::SessionStore;
use quarry_common::config::LifecycleConfig;
use quarry_common::models::{CompletionTrigger, MessageRole, ResearchSession, SessionMetadata};
use quarry_common::{metrics, text, AppError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const SATISFACTION_PHRASES: &[&str] = &[
    "thanks that's all",
    "thank you that's all",
    "that's all",
    "that's all i needed",
    "that's helpful",
    "that was helpful",
    "very helpful thanks",
    "got it thanks",
    "perfect thanks",
    "that answers my question",
    "that answers it",
    "all set",
    "no more questions",
    "i'm done",
    "we're done",
];

const NEW_TOPIC_PHRASES: &[&str] = &[
    "new topic",
    "different topic",
    "different question",
    "unrelated question",
    "something else",
    "let's talk about something else",
    "change of topic",
    "changing topics",
    "switching topics",
    "on another note",
];

/// Removes the session from the in-flight set when the transition ends
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<Uuid>>, id: Uuid) -> Option<Self> {
        let inserted = set.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
        inserted.then_some(Self { set, id })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub struct LifecycleMonitor {
    store: Arc<dyn SessionStore>,
    metadata: MetadataGenerator,
    config: LifecycleConfig,
    timers: Mutex<HashMap<Uuid, CancellationToken>>,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl LifecycleMonitor {
    pub fn new(
        store: Arc<dyn SessionStore>,
        metadata: MetadataGenerator,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            config,
            timers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Keywords describing what the session has been about so far
    fn topic_keywords(session: &ResearchSession) -> HashSet<String> {
        let mut topics = text::keyword_set(&session.origin_query.text);
        for message in &session.conversation {
            if message.role == MessageRole::User {
                topics.extend(text::keywords(&message.content));
            }
        }
        for phrase in &session.topic_keyphrases {
            topics.extend(text::keywords(phrase));
        }
        topics
    }

    /// Which completion trigger, if any, an incoming user message fires
    pub fn evaluate(&self, session: &ResearchSession, message: &str) -> Option<CompletionTrigger> {
        if text::contains_any_phrase(message, SATISFACTION_PHRASES) {
            return Some(CompletionTrigger::Satisfaction);
        }
        if text::contains_any_phrase(message, NEW_TOPIC_PHRASES) {
            return Some(CompletionTrigger::NewTopic);
        }

        let topics = Self::topic_keywords(session);
        let incoming = text::keyword_set(message);
        let min = self.config.min_topic_keywords;
        if topics.len() < min || incoming.len() < min {
            return None;
        }

        let shared = incoming.intersection(&topics).count();
        let overlap = shared as f32 / incoming.len() as f32;
        debug!(session_id = %session.session_id, overlap, "Topic overlap");
        (overlap < self.config.topic_shift_threshold).then_some(CompletionTrigger::TopicShift)
    }

    /// Feed a follow-up user message. Returns the trigger that completed the
    /// session, or `None` after resetting its inactivity timer.
    pub async fn on_user_message(
        self: &Arc<Self>,
        session_id: Uuid,
        message: &str,
    ) -> Result<Option<CompletionTrigger>> {
        let session = self.store.get(session_id).await?;
        if session.is_complete() {
            return Err(AppError::SessionClosed {
                id: session_id.to_string(),
            });
        }

        match self.evaluate(&session, message) {
            Some(trigger) => {
                self.complete(session_id, trigger).await?;
                Ok(Some(trigger))
            }
            None => {
                self.touch(session_id);
                Ok(None)
            }
        }
    }

    /// Start or restart the inactivity timer for a session
    pub fn touch(self: &Arc<Self>, session_id: Uuid) {
        let token = CancellationToken::new();
        let previous = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let monitor = Arc::clone(self);
        let timeout = self.config.inactivity_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    info!(session_id = %session_id, timeout_secs = timeout.as_secs(), "Session inactive");
                    if let Err(e) = monitor.complete(session_id, CompletionTrigger::Inactivity).await {
                        warn!(session_id = %session_id, error = %e, "Inactivity completion failed");
                    }
                }
            }
        });
    }

    pub fn stop_timer(&self, session_id: Uuid) {
        let token = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub fn active_timers(&self) -> usize {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Perform the active -> complete transition.
    ///
    /// Returns `None` when another trigger already owns or finished the
    /// transition.
    #[instrument(skip_all, fields(session_id = %session_id, trigger = trigger.as_str()))]
    pub async fn complete(
        &self,
        session_id: Uuid,
        trigger: CompletionTrigger,
    ) -> Result<Option<ResearchSession>> {
        let Some(_guard) = InFlight::acquire(&self.in_flight, session_id) else {
            debug!("Transition already in flight");
            return Ok(None);
        };

        let session = self.store.get(session_id).await?;
        if session.is_complete() {
            return Ok(None);
        }
        self.stop_timer(session_id);

        let metadata = match self.metadata.generate(&session).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "Metadata generation failed, completing without metadata");
                SessionMetadata::default()
            }
        };
        let with_metadata = !metadata.is_empty();

        let completed = match self.store.complete(session_id, trigger, metadata).await {
            Ok(session) => session,
            Err(AppError::SessionClosed { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        metrics::record_session_completed(trigger.as_str(), with_metadata);
        info!(with_metadata, "Session completed");
        Ok(Some(completed))
    }

    /// Host backgrounding/termination: complete every active session
    pub async fn on_host_signal(&self) -> Result<Vec<Uuid>> {
        let ids = self.store.list_active_ids().await?;
        let results = futures::future::join_all(
            ids.iter()
                .map(|id| self.complete(*id, CompletionTrigger::HostSignal)),
        )
        .await;

        let mut completed = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(Some(_)) => completed.push(*id),
                Ok(None) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Host-signal completion failed"),
            }
        }
        info!(count = completed.len(), "Host signal processed");
        Ok(completed)
    }

    /// Cancel all inactivity timers (process shutdown)
    pub fn shutdown(&self) {
        let timers: Vec<CancellationToken> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, token)| token)
            .collect();
        timers.iter().for_each(CancellationToken::cancel);
    }
}
