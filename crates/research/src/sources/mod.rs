//! External knowledge sources
//!
//! Provides:
//! - The `SourceClient` trait, one implementation per source type
//! - `HttpSourceClient` for JSON search endpoints
//! - `StaticSourceClient`, an in-process client for tests and demos

mod http;

pub use http::HttpSourceClient;

use async_trait::async_trait;
use quarry_common::config::SourcesConfig;
use quarry_common::models::{SourceCandidate, SourceType};
use quarry_common::{AppError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Client for one external source
#[async_trait]
pub trait SourceClient: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Fetch up to `count` candidates for `query`, finishing within `timeout`
    async fn fetch(&self, query: &str, count: usize, timeout: Duration) -> Result<Vec<SourceCandidate>>;
}

/// Configured clients, iterated in `SourceType` order
pub type SourceClients = BTreeMap<SourceType, Arc<dyn SourceClient>>;

/// Build HTTP clients for every enabled source with an endpoint
pub fn build_clients(config: &SourcesConfig) -> Result<SourceClients> {
    let mut clients: SourceClients = BTreeMap::new();

    for source in SourceType::ALL {
        let endpoint_config = config.get(source);
        if !endpoint_config.enabled {
            tracing::info!(source = %source, "Source disabled");
            continue;
        }
        let Some(endpoint) = endpoint_config.endpoint.clone() else {
            tracing::warn!(source = %source, "Source enabled without an endpoint, skipping");
            continue;
        };

        let client = HttpSourceClient::new(
            source,
            endpoint,
            endpoint_config.api_key.clone(),
            endpoint_config.max_retries,
        )?;
        clients.insert(source, Arc::new(client));
    }

    Ok(clients)
}

/// In-process source returning a fixed candidate list
pub struct StaticSourceClient {
    source_type: SourceType,
    candidates: Vec<SourceCandidate>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticSourceClient {
    pub fn new(source_type: SourceType, candidates: Vec<SourceCandidate>) -> Self {
        Self {
            source_type,
            candidates,
            failure: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// `count` distinct candidates about `topic`, ids `{prefix}-{n}`
    pub fn synthetic(source_type: SourceType, topic: &str, count: usize) -> Self {
        let candidates = (1..=count)
            .map(|n| {
                SourceCandidate::new(
                    source_type,
                    format!("{}-{}", source_type.as_str(), n),
                    format!("{} finding {} ({})", topic, n, source_type),
                    format!("Result {} discussing {}.", n, topic),
                    format!("https://{}.example/{}", source_type.as_str(), n),
                )
            })
            .collect();
        Self::new(source_type, candidates)
    }

    pub fn failing(source_type: SourceType, message: impl Into<String>) -> Self {
        let mut client = Self::new(source_type, Vec::new());
        client.failure = Some(message.into());
        client
    }

    /// Sleep before answering (exercises timeouts)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for StaticSourceClient {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn fetch(&self, _query: &str, count: usize, _timeout: Duration) -> Result<Vec<SourceCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(AppError::SourceUnavailable {
                source_type: self.source_type.to_string(),
                message: message.clone(),
            });
        }
        Ok(self.candidates.iter().take(count).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_clients_skips_missing_endpoints() {
        let mut config = SourcesConfig::default();
        config.literature.endpoint = Some("http://localhost:9000/search".into());
        config.preprint.endpoint = Some("http://localhost:9001/search".into());
        config.preprint.enabled = false;

        let clients = build_clients(&config).unwrap();
        assert_eq!(clients.keys().copied().collect::<Vec<_>>(), vec![SourceType::Literature]);
    }

    #[tokio::test]
    async fn test_static_client_respects_count() {
        let client = StaticSourceClient::synthetic(SourceType::Web, "statins", 10);
        let results = client.fetch("statins", 4, Duration::from_secs(1)).await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].id, "web-1");
        assert_eq!(client.calls(), 1);
    }
}
