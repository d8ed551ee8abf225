//! Query engine
//!
//! Entry point for one user query. Routes it to a tier, resolves which
//! session it belongs to, lets the lifecycle monitor close finished sessions,
//! and dispatches to recall, a direct answer or the research orchestrator.
//! Every path ends with exactly one `completed` event on the emitter.

use crate::fetcher::Fetcher;
use crate::orchestrator::Orchestrator;
use crate::ranker::Ranker;
use crate::reflector::LlmReflector;
use crate::registry::CancellationRegistry;
use crate::router::TierRouter;
use crate::sources::SourceClients;
use crate::streaming::StreamEmitter;
use crate::synthesis::LlmSynthesizer;
use quarry_common::config::LlmConfig;
use quarry_common::llm::{self, GenerationRequest, Generator};
use quarry_common::models::{
    CitationRef, CompletionTrigger, MessageRole, Query, ResearchSession, Stage, StopReason, Tier,
};
use quarry_common::{AppConfig, AppError, Embedder, Result};
use quarry_sessions::{LifecycleMonitor, MetadataGenerator, RecallOutcome, RecallSearch, SessionStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const DIRECT_SYSTEM_PROMPT: &str = "You are a knowledgeable assistant. Answer the user's latest \
message directly and concisely, using the conversation for context.";

const ACKNOWLEDGEMENT: &str = "Glad that helped. I've closed this research session; ask anytime \
if you want to pick it up again.";

const DIRECT_FALLBACK: &str = "I couldn't put together an answer right now. Please try again.";

const DIRECT_MAX_TOKENS: usize = 800;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    /// Continue this session when it is still active
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default = "default_user")]
    pub user_id: String,
    #[serde(default = "default_locale")]
    pub locale: String,
}

fn default_user() -> String {
    "anonymous".to_string()
}

fn default_locale() -> String {
    "en".to_string()
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
            user_id: default_user(),
            locale: default_locale(),
        }
    }

    pub fn in_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineOutcome {
    Recall {
        outcome: RecallOutcome,
    },
    Answered {
        session_id: Uuid,
        tier: Tier,
        answer: String,
        citations: Vec<CitationRef>,
        degraded: bool,
        /// Set for retrieval tiers
        stop_reason: Option<StopReason>,
    },
    /// The user signalled they were done; the session was completed
    Acknowledged {
        session_id: Uuid,
        message: String,
    },
}

impl EngineOutcome {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            EngineOutcome::Recall { outcome } => match outcome {
                RecallOutcome::Answer { session_id, .. } => Some(*session_id),
                _ => None,
            },
            EngineOutcome::Answered { session_id, .. } | EngineOutcome::Acknowledged { session_id, .. } => {
                Some(*session_id)
            }
        }
    }
}

/// Which session a message landed in
enum Resolved {
    Session(ResearchSession),
    Finished(Uuid),
}

pub struct QueryEngine {
    router: TierRouter,
    store: Arc<dyn SessionStore>,
    lifecycle: Arc<LifecycleMonitor>,
    recall: Arc<RecallSearch>,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<CancellationRegistry>,
    generator: Arc<dyn Generator>,
    temperature: f32,
    timeout: Duration,
}

impl QueryEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: TierRouter,
        store: Arc<dyn SessionStore>,
        lifecycle: Arc<LifecycleMonitor>,
        recall: Arc<RecallSearch>,
        orchestrator: Arc<Orchestrator>,
        registry: Arc<CancellationRegistry>,
        generator: Arc<dyn Generator>,
        llm: &LlmConfig,
    ) -> Self {
        Self {
            router,
            store,
            lifecycle,
            recall,
            orchestrator,
            registry,
            generator,
            temperature: llm.synthesis_temperature,
            timeout: Duration::from_secs(llm.timeout_secs),
        }
    }

    /// Wire every component from configuration
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn SessionStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        clients: SourceClients,
    ) -> Result<Self> {
        let registry = Arc::new(CancellationRegistry::new());
        let llm_timeout = Duration::from_secs(config.llm.timeout_secs);

        let reflector = Arc::new(LlmReflector::new(
            generator.clone(),
            config.llm.reflector_temperature,
            llm_timeout,
        ));
        let synthesizer = Arc::new(LlmSynthesizer::new(
            generator.clone(),
            config.llm.synthesis_temperature,
            config.llm.synthesis_max_tokens,
            llm_timeout,
        )?);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Fetcher::new(clients, config.sources.clone()),
            Ranker::new(embedder, config.ranking.clone(), &config.research),
            reflector,
            synthesizer,
            registry.clone(),
            &config.research,
        ));

        let lifecycle = Arc::new(LifecycleMonitor::new(
            store.clone(),
            MetadataGenerator::new(generator.clone(), config.lifecycle.metadata_timeout()),
            config.lifecycle.clone(),
        ));
        let recall = Arc::new(RecallSearch::new(store.clone(), generator.clone(), config.recall.clone()));

        Ok(Self::new(
            TierRouter::new()?,
            store,
            lifecycle,
            recall,
            orchestrator,
            registry,
            generator,
            &config.llm,
        ))
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleMonitor> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    pub fn recall_search(&self) -> &Arc<RecallSearch> {
        &self.recall
    }

    /// Handle one query, publishing progress on `emitter`
    #[instrument(skip_all, fields(user_id = %request.user_id, session_id = ?request.session_id))]
    pub async fn handle(&self, request: QueryRequest, emitter: &StreamEmitter) -> Result<EngineOutcome> {
        let routing = match self.router.classify(&request.query) {
            Ok(routing) => routing,
            Err(e) => {
                emitter.error(e.to_string());
                return Err(e);
            }
        };
        info!(tier = %routing.tier, reason = routing.reason, "Query routed");
        emitter.tier(routing.tier);

        let query = Query::new(request.query.trim(), request.locale.as_str(), request.user_id.as_str());
        let result = match routing.tier {
            Tier::Recall => self.handle_recall(&query, emitter).await,
            tier => self.handle_conversation(query, request.session_id, tier, emitter).await,
        };

        if let Err(e) = &result {
            warn!(error = %e, "Query failed");
            emitter.error(e.to_string());
        }
        result
    }

    async fn handle_recall(&self, query: &Query, emitter: &StreamEmitter) -> Result<EngineOutcome> {
        emitter.stage(Stage::Recalling, None, "Searching earlier sessions");
        let outcome = self.recall.recall(query).await?;

        let (text, degraded) = match &outcome {
            RecallOutcome::NoMatch { offer } => (offer.clone(), false),
            RecallOutcome::Answer { answer, degraded, .. } => (answer.clone(), *degraded),
            RecallOutcome::Disambiguate { prompt, .. } => (prompt.clone(), false),
        };
        emitter.token(&text);
        emitter.stage(Stage::Done, None, "Recall complete");
        emitter.complete(text, Vec::new(), degraded);

        Ok(EngineOutcome::Recall { outcome })
    }

    /// Start a session for `query` with its first user message recorded
    async fn start_session(&self, query: Query, tier: Tier) -> Result<ResearchSession> {
        let text = query.text.clone();
        let mut session = ResearchSession::new(query, tier);
        session.append_message(MessageRole::User, text)?;
        let id = session.session_id;
        self.store.insert(session.clone()).await?;
        self.lifecycle.touch(id);
        info!(session_id = %id, tier = %tier, "Session started");
        Ok(session)
    }

    async fn resolve_session(&self, query: Query, session_id: Option<Uuid>, tier: Tier) -> Result<Resolved> {
        let Some(session_id) = session_id else {
            return self.start_session(query, tier).await.map(Resolved::Session);
        };

        let existing = self.store.get(session_id).await?;
        if existing.is_complete() {
            info!(session_id = %session_id, "Follow-up to a completed session, starting a new one");
            return self.start_session(query, tier).await.map(Resolved::Session);
        }

        let evaluated = self.lifecycle.on_user_message(session_id, &query.text).await;
        match evaluated {
            Ok(None) => {
                self.store
                    .append_message(session_id, MessageRole::User, query.text.clone())
                    .await?;
                self.store.get(session_id).await.map(Resolved::Session)
            }
            Ok(Some(CompletionTrigger::Satisfaction)) => Ok(Resolved::Finished(session_id)),
            Ok(Some(trigger)) => {
                info!(session_id = %session_id, trigger = trigger.as_str(), "Previous session closed");
                self.start_session(query, tier).await.map(Resolved::Session)
            }
            // Another trigger completed it between the read and the evaluation
            Err(AppError::SessionClosed { .. }) => self.start_session(query, tier).await.map(Resolved::Session),
            Err(e) => Err(e),
        }
    }

    async fn handle_conversation(
        &self,
        query: Query,
        session_id: Option<Uuid>,
        tier: Tier,
        emitter: &StreamEmitter,
    ) -> Result<EngineOutcome> {
        let session = match self.resolve_session(query, session_id, tier).await? {
            Resolved::Session(session) => session,
            Resolved::Finished(session_id) => {
                emitter.attach_session(session_id);
                emitter.token(ACKNOWLEDGEMENT);
                emitter.stage(Stage::Done, None, "Session complete");
                emitter.complete(ACKNOWLEDGEMENT, Vec::new(), false);
                return Ok(EngineOutcome::Acknowledged {
                    session_id,
                    message: ACKNOWLEDGEMENT.to_string(),
                });
            }
        };
        emitter.attach_session(session.session_id);

        let outcome = if tier.uses_retrieval() {
            let outcome = self.orchestrator.run(session.session_id, tier, emitter).await?;
            if outcome.stop_reason == StopReason::SourceOutage {
                self.close_after_outage(outcome.session_id).await;
            }
            EngineOutcome::Answered {
                session_id: outcome.session_id,
                tier,
                answer: outcome.answer,
                citations: outcome.citations,
                degraded: outcome.degraded,
                stop_reason: Some(outcome.stop_reason),
            }
        } else {
            self.answer_directly(&session, emitter).await?
        };

        if let EngineOutcome::Answered {
            answer,
            citations,
            degraded,
            ..
        } = &outcome
        {
            emitter.stage(Stage::Done, None, "Answer complete");
            emitter.complete(answer.clone(), citations.clone(), *degraded);
        }
        Ok(outcome)
    }

    /// No source answered, so the degraded answer just persisted is final
    async fn close_after_outage(&self, session_id: Uuid) {
        match self.lifecycle.complete(session_id, CompletionTrigger::SourceOutage).await {
            Ok(Some(_)) => info!(session_id = %session_id, "Session closed after source outage"),
            Ok(None) => {}
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to close session after source outage"),
        }
    }

    /// One generation over the conversation, no retrieval
    async fn answer_directly(&self, session: &ResearchSession, emitter: &StreamEmitter) -> Result<EngineOutcome> {
        let session_id = session.session_id;
        let guard = self.registry.register(session_id)?;
        emitter.stage(Stage::Answering, None, "Answering");

        let request = GenerationRequest::new(
            DIRECT_SYSTEM_PROMPT,
            format!("{}\n\nAssistant:", session.conversation_text()),
        )
        .temperature(self.temperature)
        .max_tokens(DIRECT_MAX_TOKENS)
        .timeout(self.timeout);

        let on_token = |token: &str| emitter.token(token);
        let generated = tokio::select! {
            biased;
            _ = guard.token().cancelled() => Err(AppError::Cancelled),
            result = llm::bounded_streaming(self.generator.as_ref(), &request, &on_token) => result,
        };
        drop(guard);

        let (answer, degraded) = match generated {
            Ok(answer) => (answer, false),
            Err(AppError::Cancelled) => {
                return Ok(EngineOutcome::Answered {
                    session_id,
                    tier: Tier::Direct,
                    answer: "The answer was cancelled.".to_string(),
                    citations: Vec::new(),
                    degraded: true,
                    stop_reason: None,
                });
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Direct answer failed");
                emitter.token(DIRECT_FALLBACK);
                (DIRECT_FALLBACK.to_string(), true)
            }
        };

        self.store
            .append_message(session_id, MessageRole::Assistant, answer.clone())
            .await?;

        Ok(EngineOutcome::Answered {
            session_id,
            tier: Tier::Direct,
            answer,
            citations: Vec::new(),
            degraded,
            stop_reason: None,
        })
    }
}
