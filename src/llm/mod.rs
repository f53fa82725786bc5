//! LLM provider abstraction.
//!
//! Defines the [`LlmProvider`] trait (embeddings plus optional chat) and the
//! concrete implementations:
//!
//! - [`http::HttpLlmProvider`] — OpenAI-compatible and Ollama-style HTTPS
//!   APIs, with retry, backoff, and the shared rate limiter.
//! - [`FakeLlmProvider`] — deterministic hash-derived vectors; selected by
//!   `provider: fake`, used throughout the test suite and for offline
//!   smoke runs.
//!
//! The provider owns the only throttles in the system: a concurrency gate
//! plus rpm/tpm token buckets ([`limiter::RateLimiter`]). Callers wait,
//! they never fail on exhaustion and they never add sleeps of their own.
//!
//! Token counting ([`TokenCounter`]) exists solely to clamp batch sizes
//! under `max_tokens_per_request` and chunk sizes under
//! `max_tokens_per_chunk`; chunk boundaries themselves are character-based.

pub mod http;
pub mod limiter;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::{Result, SemIndexError};

/// A chat message for the optional `chat` operation (image captions during
/// file conversion; never on the embedding hot path).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Interface over the remote embeddings/chat API.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Embed a batch of texts; one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Chat completion. Providers without a configured chat model return
    /// [`SemIndexError::Model`].
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Dimensionality every returned embedding must have.
    fn vector_size(&self) -> usize;

    /// Token count used for batch clamping.
    fn count_tokens(&self, text: &str) -> usize;
}

// ============ Token counting ============

/// Counts tokens with cl100k_base, or estimates at 4 chars/token when the
/// tokenizer is `none`.
pub struct TokenCounter {
    bpe: Option<tiktoken_rs::CoreBPE>,
}

impl TokenCounter {
    pub fn new(tokenizer: &str) -> Result<Self> {
        match tokenizer {
            "cl100k_base" => {
                let bpe = tiktoken_rs::cl100k_base()
                    .map_err(|e| SemIndexError::Config(format!("tokenizer init failed: {e}")))?;
                Ok(Self { bpe: Some(bpe) })
            }
            "none" => Ok(Self { bpe: None }),
            other => Err(SemIndexError::Config(format!(
                "unknown tokenizer '{other}'"
            ))),
        }
    }

    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.chars().count().div_ceil(4),
        }
    }
}

// ============ Batching ============

/// Group texts into batches whose summed token counts stay under
/// `max_tokens_per_request`. A single oversized text still gets its own
/// batch; the per-chunk clamp happens upstream in the chunker.
pub fn batch_by_tokens<'a>(
    texts: &'a [String],
    provider: &dyn LlmProvider,
    max_tokens_per_request: usize,
) -> Vec<Vec<&'a String>> {
    let mut batches = Vec::new();
    let mut current: Vec<&String> = Vec::new();
    let mut current_tokens = 0usize;

    for text in texts {
        let tokens = provider.count_tokens(text);
        if !current.is_empty() && current_tokens + tokens > max_tokens_per_request {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current.push(text);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

// ============ Fake provider ============

/// Deterministic provider for tests and offline runs.
///
/// Each text maps to a unit vector derived from its SHA-256 digest, so
/// identical texts embed identically and similar-but-different texts spread
/// over the sphere.
pub struct FakeLlmProvider {
    vector_size: usize,
}

impl FakeLlmProvider {
    pub fn new(vector_size: usize) -> Self {
        Self { vector_size }
    }
}

#[async_trait]
impl LlmProvider for FakeLlmProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| hash_vector(t, self.vector_size))
            .collect())
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        Ok(format!("description of: {}", last.chars().take(64).collect::<String>()))
    }

    fn vector_size(&self) -> usize {
        self.vector_size
    }

    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Unit vector from a SHA-256 digest, cycled to `size` dimensions.
pub fn hash_vector(text: &str, size: usize) -> Vec<f32> {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut v: Vec<f32> = (0..size)
        .map(|i| {
            let b = digest[i % digest.len()];
            // Spread into [-1, 1], perturbed by position so cycling the
            // digest does not produce a periodic vector.
            (b as f32 / 127.5 - 1.0) + ((i / digest.len()) as f32 * 0.01)
        })
        .collect();

    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Instantiate the provider selected by the configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "fake" => Ok(Arc::new(FakeLlmProvider::new(config.embeddings.vector_size))),
        "openai" | "openai_compat" | "ollama" | "custom" => {
            Ok(Arc::new(http::HttpLlmProvider::new(config)?))
        }
        other => Err(SemIndexError::Config(format!(
            "unknown llm.provider '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_vectors_are_deterministic_unit_vectors() {
        let a = hash_vector("hello", 64);
        let b = hash_vector("hello", 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn different_texts_differ() {
        assert_ne!(hash_vector("a", 16), hash_vector("b", 16));
    }

    #[tokio::test]
    async fn fake_provider_embeds_in_order() {
        let provider = FakeLlmProvider::new(8);
        let texts = vec!["one".to_string(), "two".to_string()];
        let vectors = provider.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 8);
        assert_eq!(vectors[0], hash_vector("one", 8));
    }

    #[test]
    fn batches_respect_token_budget() {
        let provider = FakeLlmProvider::new(4);
        // 40 chars each → 10 tokens each under the 4-chars heuristic.
        let texts: Vec<String> = (0..5).map(|i| format!("{:0>40}", i)).collect();
        let batches = batch_by_tokens(&texts, &provider, 20);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn oversized_text_gets_own_batch() {
        let provider = FakeLlmProvider::new(4);
        let texts = vec!["x".repeat(400), "small".to_string()];
        let batches = batch_by_tokens(&texts, &provider, 50);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
    }

    #[test]
    fn token_counter_none_estimates() {
        let counter = TokenCounter::new("none").unwrap();
        assert_eq!(counter.count("abcdefgh"), 2);
        assert_eq!(counter.count(""), 0);
    }
}
