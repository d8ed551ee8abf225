//! Text generation abstraction
//!
//! Every call that needs a language model (synthesis, reflection, session
//! summaries, recall answers) goes through [`Generator`] with an explicit
//! timeout carried on the request.
//!
//! Provides:
//! - The `Generator` trait with a token-streaming variant
//! - `bounded`, which enforces the request timeout and normalizes errors
//! - An OpenAI-compatible chat completions client
//! - `MockGenerator` for tests and offline runs

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One text generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.3,
            max_tokens: 1000,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Token callback for streamed generation
pub type OnToken<'a> = dyn for<'t> Fn(&'t str) + Send + Sync + 'a;

/// Opaque text-generation service
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Generate and hand each token to `on_token` as it becomes available.
    /// Returns the full text. The default chunks a blocking generation.
    async fn generate_streaming(
        &self,
        request: &GenerationRequest,
        on_token: &OnToken<'_>,
    ) -> Result<String> {
        let text = self.generate(request).await?;
        for token in text.split_inclusive(' ') {
            on_token(token);
        }
        Ok(text)
    }

    fn model_name(&self) -> &str;
}

fn normalize_error(err: AppError) -> AppError {
    match err {
        e @ (AppError::GenerationError { .. } | AppError::GenerationTimeout { .. }) => e,
        other => AppError::GenerationError {
            message: other.to_string(),
        },
    }
}

/// Run a generation under the request's timeout
pub async fn bounded(generator: &dyn Generator, request: &GenerationRequest) -> Result<String> {
    let start = Instant::now();
    let result = match tokio::time::timeout(request.timeout, generator.generate(request)).await {
        Ok(result) => result.map_err(normalize_error),
        Err(_) => Err(AppError::GenerationTimeout {
            timeout_ms: request.timeout.as_millis() as u64,
        }),
    };
    record(generator, start, &result);
    result
}

/// Streaming counterpart of [`bounded`]
pub async fn bounded_streaming(
    generator: &dyn Generator,
    request: &GenerationRequest,
    on_token: &OnToken<'_>,
) -> Result<String> {
    let start = Instant::now();
    let result = match tokio::time::timeout(
        request.timeout,
        generator.generate_streaming(request, on_token),
    )
    .await
    {
        Ok(result) => result.map_err(normalize_error),
        Err(_) => Err(AppError::GenerationTimeout {
            timeout_ms: request.timeout.as_millis() as u64,
        }),
    };
    record(generator, start, &result);
    result
}

fn record(generator: &dyn Generator, start: Instant, result: &Result<String>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(AppError::GenerationTimeout { .. }) => "timeout",
        Err(_) => "error",
    };
    crate::metrics::record_generation(generator.model_name(), start.elapsed().as_secs_f64(), outcome);
}

/// OpenAI-compatible chat completions client
pub struct OpenAIChatGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl OpenAIChatGenerator {
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Generator for OpenAIChatGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::GenerationError {
                message: format!("LLM API request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GenerationError {
                message: format!("LLM API error {}: {}", status, body),
            });
        }

        let chat: ChatResponse = response.json().await.map_err(|e| AppError::GenerationError {
            message: format!("Failed to parse LLM response: {}", e),
        })?;

        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::GenerationError {
                message: "No response from LLM".to_string(),
            })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

type ResponseFn = dyn Fn(&GenerationRequest) -> Result<String> + Send + Sync;

/// Scriptable generator for tests and the `mock` provider
pub struct MockGenerator {
    respond: Arc<ResponseFn>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockGenerator {
    pub fn from_fn<F>(respond: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            respond: Arc::new(respond),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answers with `text`
    pub fn fixed(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::from_fn(move |_| Ok(text.clone()))
    }

    /// Always fails with a generation error
    pub fn failing(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::from_fn(move |_| {
            Err(AppError::GenerationError {
                message: message.clone(),
            })
        })
    }

    /// Answers with a short acknowledgement of the prompt
    pub fn echo() -> Self {
        Self::from_fn(|request| {
            let head = crate::text::truncate_chars(&request.prompt, 200);
            Ok(format!("Mock answer based on: {}", head))
        })
    }

    /// Sleep before answering (exercises timeouts)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of generate calls observed
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(request)
    }

    fn model_name(&self) -> &str {
        "mock-generator"
    }
}

/// Create a generator based on configuration
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "llm.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAIChatGenerator::new(key, config)?))
        }
        "mock" => Ok(Arc::new(MockGenerator::echo())),
        other => {
            tracing::warn!(provider = other, "Unknown generation provider, using mock");
            Ok(Arc::new(MockGenerator::echo()))
        }
    }
}
