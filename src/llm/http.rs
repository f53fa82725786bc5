//! HTTP adapters for OpenAI-compatible and Ollama-style providers.
//!
//! One [`HttpLlmProvider`] serves all four remote provider kinds; the
//! endpoint shape is chosen by provider name:
//!
//! | Provider | Embeddings | Chat |
//! |----------|------------|------|
//! | `openai`, `openai_compat`, `custom` | `POST /v1/embeddings` | `POST /v1/chat/completions` |
//! | `ollama` | `POST /api/embed` | `POST /api/chat` |
//!
//! # Retry Strategy
//!
//! Transient failures (network errors, HTTP 408/425/429/5xx) are retried
//! with exponential backoff between `request.backoff_s_min` and
//! `request.backoff_s_max`, at most `request.max_retries` extra attempts.
//! Any other 4xx fails immediately: 401/403 as an auth error, the rest as
//! model errors. Every request first passes through the shared
//! [`RateLimiter`].

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::limiter::RateLimiter;
use super::{ChatMessage, LlmProvider, TokenCounter};
use crate::config::LlmConfig;
use crate::error::{Result, SemIndexError};

/// Which wire dialect the remote speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    OpenAi,
    Ollama,
}

pub struct HttpLlmProvider {
    client: reqwest::Client,
    config: LlmConfig,
    dialect: Dialect,
    limiter: RateLimiter,
    counter: TokenCounter,
    /// Total requests issued and retries performed, for the run report.
    requests: AtomicU64,
    retries: AtomicU64,
}

impl HttpLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let dialect = match config.provider.as_str() {
            "ollama" => Dialect::Ollama,
            "openai" | "openai_compat" | "custom" => Dialect::OpenAi,
            other => {
                return Err(SemIndexError::Config(format!(
                    "provider '{other}' is not an HTTP provider"
                )))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request.timeout_s))
            .build()?;

        Ok(Self {
            client,
            config: config.clone(),
            dialect,
            limiter: RateLimiter::new(&config.rate_limits),
            counter: TokenCounter::new(&config.tokenizer)?,
            requests: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        })
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.request.backoff_s_min.max(0.001);
        let delay = base * 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay.min(self.config.request.backoff_s_max))
    }

    /// POST a JSON body with rate limiting, retry and error classification.
    async fn post_json(&self, path: &str, body: &Value, tokens: usize) -> Result<Value> {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );

        let mut last_err: Option<SemIndexError> = None;

        for attempt in 0..=self.config.request.max_retries {
            if attempt > 0 {
                self.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }

            let permit = self.limiter.acquire(tokens).await;
            self.requests.fetch_add(1, Ordering::Relaxed);

            let mut request = self.client.post(&url).json(body);
            if let Some(key) = &self.config.api_key {
                if !key.is_empty() {
                    request = request.bearer_auth(key);
                }
            }
            for (name, value) in &self.config.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await;
            drop(permit);

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json().await?);
                    }
                    let body_text = resp.text().await.unwrap_or_default();
                    let err =
                        SemIndexError::from_status(status.as_u16(), &self.config.provider, body_text);
                    if err.is_transient() {
                        tracing::warn!(
                            provider = %self.config.provider,
                            status = status.as_u16(),
                            attempt,
                            "transient provider error, will retry"
                        );
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(provider = %self.config.provider, error = %e, attempt, "network error, will retry");
                    last_err = Some(SemIndexError::TransientNetwork {
                        target: self.config.provider.clone(),
                        detail: e.to_string(),
                    });
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| SemIndexError::Model("request failed with no attempts".into())))
    }

    fn parse_embeddings(&self, response: &Value) -> Result<Vec<Vec<f32>>> {
        let arrays: Vec<&Value> = match self.dialect {
            Dialect::OpenAi => response
                .get("data")
                .and_then(|d| d.as_array())
                .ok_or_else(|| SemIndexError::Model("embeddings response missing data".into()))?
                .iter()
                .map(|item| item.get("embedding").unwrap_or(&Value::Null))
                .collect(),
            Dialect::Ollama => response
                .get("embeddings")
                .and_then(|d| d.as_array())
                .ok_or_else(|| {
                    SemIndexError::Model("embeddings response missing embeddings".into())
                })?
                .iter()
                .collect(),
        };

        let mut vectors = Vec::with_capacity(arrays.len());
        for value in arrays {
            let floats = value
                .as_array()
                .ok_or_else(|| SemIndexError::Model("embedding is not an array".into()))?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect::<Vec<f32>>();
            if floats.len() != self.config.embeddings.vector_size {
                return Err(SemIndexError::Model(format!(
                    "provider returned vector of size {}, expected {}",
                    floats.len(),
                    self.config.embeddings.vector_size
                )));
            }
            vectors.push(floats);
        }
        Ok(vectors)
    }
}

#[async_trait::async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let tokens: usize = texts.iter().map(|t| self.counter.count(t)).sum();
        let (path, body) = match self.dialect {
            Dialect::OpenAi => (
                "/v1/embeddings",
                json!({ "model": self.config.models.embeddings, "input": texts }),
            ),
            Dialect::Ollama => (
                "/api/embed",
                json!({ "model": self.config.models.embeddings, "input": texts }),
            ),
        };

        let response = self.post_json(path, &body, tokens).await?;
        let vectors = self.parse_embeddings(&response)?;
        if vectors.len() != texts.len() {
            return Err(SemIndexError::Model(format!(
                "provider returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let model = self
            .config
            .models
            .chat
            .as_ref()
            .ok_or_else(|| SemIndexError::Model("no chat model configured".into()))?;

        let tokens: usize = messages.iter().map(|m| self.counter.count(&m.content)).sum();
        let (path, body) = match self.dialect {
            Dialect::OpenAi => (
                "/v1/chat/completions",
                json!({ "model": model, "messages": messages }),
            ),
            Dialect::Ollama => (
                "/api/chat",
                json!({ "model": model, "messages": messages, "stream": false }),
            ),
        };

        let response = self.post_json(path, &body, tokens).await?;
        let content = match self.dialect {
            Dialect::OpenAi => response
                .pointer("/choices/0/message/content")
                .and_then(|v| v.as_str()),
            Dialect::Ollama => response.pointer("/message/content").and_then(|v| v.as_str()),
        };
        content
            .map(|s| s.to_string())
            .ok_or_else(|| SemIndexError::Model("chat response missing content".into()))
    }

    fn vector_size(&self) -> usize {
        self.config.embeddings.vector_size
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }
}
