//! Shared fixtures for the research crate's tests

use crate::fetcher::Fetcher;
use crate::orchestrator::Orchestrator;
use crate::ranker::Ranker;
use crate::reflector::Reflector;
use crate::registry::CancellationRegistry;
use crate::sources::{SourceClient, SourceClients};
use crate::synthesis::{AnswerSynthesizer, LlmSynthesizer};
use async_trait::async_trait;
use quarry_common::config::{RankingConfig, ResearchConfig, SourcesConfig};
use quarry_common::embeddings::MockEmbedder;
use quarry_common::llm::{Generator, MockGenerator};
use quarry_common::models::{SourceCandidate, SourceType};
use quarry_common::Result;
use quarry_sessions::{InMemorySessionStore, SessionStore};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Returns fresh candidates on every call, ids `{source}-{call}-{n}`
pub struct PagingClient {
    source_type: SourceType,
    per_call: Option<usize>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl PagingClient {
    pub fn new(source_type: SourceType) -> Self {
        Self {
            source_type,
            per_call: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Return at most `n` candidates per call
    pub fn capped(mut self, n: usize) -> Self {
        self.per_call = Some(n);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for PagingClient {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn fetch(&self, query: &str, count: usize, _timeout: Duration) -> Result<Vec<SourceCandidate>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let n = self.per_call.map_or(count, |cap| cap.min(count));
        Ok((1..=n)
            .map(|i| {
                SourceCandidate::new(
                    self.source_type,
                    format!("{}-{}-{}", self.source_type.as_str(), call, i),
                    format!("{} result {}", query, i),
                    format!("Findings on {}", query),
                    format!("https://{}.example/{}/{}", self.source_type.as_str(), call, i),
                )
            })
            .collect())
    }
}

pub fn paging_clients() -> (SourceClients, Vec<Arc<PagingClient>>) {
    clients_from(SourceType::ALL.iter().map(|s| PagingClient::new(*s)).collect())
}

pub fn clients_from(list: Vec<PagingClient>) -> (SourceClients, Vec<Arc<PagingClient>>) {
    let mut clients: SourceClients = BTreeMap::new();
    let mut handles = Vec::new();
    for client in list {
        let client = Arc::new(client);
        clients.insert(client.source_type, client.clone() as Arc<dyn SourceClient>);
        handles.push(client);
    }
    (clients, handles)
}

pub struct Harness {
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<CancellationRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn answering_generator() -> Arc<dyn Generator> {
    Arc::new(MockGenerator::fixed("Statins show a modest association [1], and trials disagree [2]."))
}

pub fn synthesizer_with(generator: Arc<dyn Generator>) -> Arc<dyn AnswerSynthesizer> {
    match LlmSynthesizer::new(generator, 0.3, 500, Duration::from_secs(10)) {
        Ok(s) => Arc::new(s),
        Err(e) => panic!("synthesizer: {e}"),
    }
}

pub fn harness(
    clients: SourceClients,
    reflector: Arc<dyn Reflector>,
    synthesizer: Arc<dyn AnswerSynthesizer>,
    research: ResearchConfig,
) -> Harness {
    let store: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
    let registry = Arc::new(CancellationRegistry::new());
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Fetcher::new(clients, SourcesConfig::default()),
        Ranker::new(Arc::new(MockEmbedder::new(64)), RankingConfig::default(), &research),
        reflector,
        synthesizer,
        registry.clone(),
        &research,
    ));
    Harness {
        store,
        registry,
        orchestrator,
    }
}
