use super::SourceClient;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoffBuilder};
use chrono::NaiveDate;
use quarry_common::models::{SourceCandidate, SourceType};
use quarry_common::{AppError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

/// Client for a JSON search endpoint.
///
/// Request: `POST {endpoint}` with `{"query": ..., "limit": n}`.
/// Reply: `{"results": [{"id"?, "title", "snippet" | "abstract", "url", "published_date"?}]}`.
pub struct HttpSourceClient {
    source_type: SourceType,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    max_retries: u32,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    limit: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(default)]
    id: Option<String>,
    title: String,
    #[serde(default, alias = "abstract", alias = "summary")]
    snippet: String,
    url: String,
    #[serde(default, alias = "date", alias = "published")]
    published_date: Option<String>,
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM` and `YYYY`
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let prefix = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(&format!("{}-01", raw.get(..7)?), "%Y-%m-%d").ok())
        .or_else(|| {
            let year: i32 = raw.get(..4)?.parse().ok()?;
            NaiveDate::from_ymd_opt(year, 1, 1)
        })
}

/// Stable id for hits that do not carry one
fn url_id(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

impl HttpSourceClient {
    pub fn new(
        source_type: SourceType,
        endpoint: String,
        api_key: Option<String>,
        max_retries: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            source_type,
            client,
            endpoint,
            api_key,
            max_retries,
        })
    }

    fn to_candidate(&self, hit: SearchHit) -> SourceCandidate {
        let id = hit
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| url_id(&hit.url));
        let mut candidate = SourceCandidate::new(self.source_type, id, hit.title, hit.snippet, hit.url);
        candidate.published_date = hit.published_date.as_deref().and_then(parse_date);
        candidate
    }

    async fn request(
        &self,
        query: &str,
        count: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<SourceCandidate>, backoff::Error<AppError>> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&SearchRequest { query, limit: count });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let source_type = self.source_type.to_string();
        let response = builder.send().await.map_err(|e| {
            let err = AppError::SourceUnavailable {
                source_type: source_type.clone(),
                message: e.to_string(),
            };
            if e.is_timeout() || e.is_connect() {
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let err = AppError::SourceUnavailable {
                source_type,
                message: format!("HTTP {}", status),
            };
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            });
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            backoff::Error::permanent(AppError::SourceUnavailable {
                source_type,
                message: format!("malformed response: {}", e),
            })
        })?;

        Ok(body
            .results
            .into_iter()
            .take(count)
            .map(|hit| self.to_candidate(hit))
            .collect())
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn fetch(&self, query: &str, count: usize, timeout: Duration) -> Result<Vec<SourceCandidate>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(250))
            .with_max_elapsed_time(Some(timeout))
            .build();

        let max_attempts = self.max_retries as usize + 1;
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let attempts = &attempts;
        let attempt = move || async move {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            match self.request(query, count, timeout).await {
                Err(backoff::Error::Transient { err, .. }) if n >= max_attempts => {
                    Err(backoff::Error::permanent(err))
                }
                Err(e) => {
                    warn!(source = %self.source_type, attempt = n, error = %e, "Source request failed");
                    Err(e)
                }
                ok => ok,
            }
        };

        let result = tokio::time::timeout(timeout, retry(policy, attempt)).await;
        match result {
            Ok(Ok(candidates)) => {
                debug!(source = %self.source_type, count = candidates.len(), "Source fetch complete");
                Ok(candidates)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AppError::SourceTimeout {
                source_type: self.source_type.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("2023-04-05"), NaiveDate::from_ymd_opt(2023, 4, 5));
        assert_eq!(parse_date("2023-04-05T10:00:00Z"), NaiveDate::from_ymd_opt(2023, 4, 5));
        assert_eq!(parse_date("2021-07"), NaiveDate::from_ymd_opt(2021, 7, 1));
        assert_eq!(parse_date("2019"), NaiveDate::from_ymd_opt(2019, 1, 1));
        assert_eq!(parse_date("n.d."), None);
    }

    #[test]
    fn test_hit_mapping_fills_missing_id() {
        let client = HttpSourceClient::new(SourceType::Web, "http://localhost".into(), None, 1).unwrap();
        let hit: SearchHit = serde_json::from_value(serde_json::json!({
            "title": "Statins",
            "abstract": "An abstract",
            "url": "https://example.org/a",
            "date": "2022"
        }))
        .unwrap();

        let candidate = client.to_candidate(hit);
        assert_eq!(candidate.id, url_id("https://example.org/a"));
        assert_eq!(candidate.id.len(), 16);
        assert_eq!(candidate.snippet, "An abstract");
        assert_eq!(candidate.published_date, NaiveDate::from_ymd_opt(2022, 1, 1));
    }
}
