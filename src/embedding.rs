//! Embedding provider: trait, HTTP reference client, retry, and caching.
//!
//! Embeddings must be deterministic with respect to input text at least
//! within a cache window, so the indexing and query paths agree. The cache
//! wrapper guarantees that window; the retry wrapper absorbs transient
//! upstream failures with bounded exponential backoff.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// The advertised vector dimension; a deployment constant.
    fn dimension(&self) -> usize;
}

/// Configuration for the HTTP embedding client.
#[derive(Debug, Clone)]
pub struct EmbeddingClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Model identifier
    pub model: String,
    /// Advertised vector dimension
    pub dimension: usize,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl EmbeddingClientConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, dimension: usize) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: model.into(),
            dimension,
            timeout_secs: 30,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

// Embedding API wire types
#[derive(Debug, Serialize)]
struct EmbeddingApiRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingApiData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiError {
    error: EmbeddingApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiErrorDetail {
    message: String,
}

/// HTTP embedding client for an OpenAI-compatible embeddings endpoint.
pub struct HttpEmbeddingClient {
    config: EmbeddingClientConfig,
    http: Client,
}

impl HttpEmbeddingClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: EmbeddingClientConfig) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let api_request = EmbeddingApiRequest {
            model: self.config.model.clone(),
            input: vec![text.to_string()],
        };

        let url = format!("{}/v1/embeddings", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::transient("embedding", format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transient("embedding", format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            let message = serde_json::from_str::<EmbeddingApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            // Rate limits and server errors are worth retrying; the rest are not.
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(Error::transient("embedding", format!("{}: {}", status, message)))
            } else {
                Err(Error::permanent("embedding", format!("{}: {}", status, message)))
            };
        }

        let api_response: EmbeddingApiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::permanent("embedding", format!("Failed to parse response: {}", e)))?;

        let vector = api_response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::permanent("embedding", "No embedding in response"))?;

        if vector.len() != self.config.dimension {
            return Err(Error::index_skew(self.config.dimension, vector.len()));
        }

        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

/// Wrapper retrying transient failures with exponential backoff.
pub struct RetryingEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    retry: RetryConfig,
}

impl RetryingEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl EmbeddingProvider for RetryingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut attempt = 0;
        loop {
            match self.inner.embed(text).await {
                Ok(vector) => return Ok(vector),
                Err(err) if err.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, "transient embedding failure, retrying: {}", err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// Cache key for an embedding input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingKey(String);

impl EmbeddingKey {
    /// Generate a key from the raw text.
    pub fn from_text(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();
        Self(format!("{:x}", hash))
    }
}

struct CachedVector {
    vector: Vec<f32>,
    created_at: DateTime<Utc>,
}

/// TTL cache in front of an embedding provider.
///
/// Within the TTL window a given text always resolves to the same vector,
/// which is what keeps query-time and index-time representations aligned.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    entries: RwLock<HashMap<EmbeddingKey, CachedVector>>,
    ttl: Duration,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            inner,
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::minutes(10),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Drop expired entries.
    pub async fn cleanup(&self) {
        let cutoff = Utc::now() - self.ttl;
        let mut entries = self.entries.write().await;
        entries.retain(|_, v| v.created_at > cutoff);
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = EmbeddingKey::from_text(text);
        let cutoff = Utc::now() - self.ttl;

        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(&key) {
                if cached.created_at > cutoff {
                    debug!("embedding cache hit");
                    return Ok(cached.vector.clone());
                }
            }
        }

        let vector = self.inner.embed(text).await?;

        let mut entries = self.entries.write().await;
        entries.insert(
            key,
            CachedVector {
                vector: vector.clone(),
                created_at: Utc::now(),
            },
        );

        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FlakyEmbedder, HashEmbedder};
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_embedding_key_is_deterministic() {
        let a = EmbeddingKey::from_text("45.99 USD US grocery card purchase");
        let b = EmbeddingKey::from_text("45.99 USD US grocery card purchase");
        let c = EmbeddingKey::from_text("45.99 USD US fuel card purchase");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_cached_embedder_hits_within_ttl() {
        let inner = Arc::new(HashEmbedder::new(8));
        let cache = CachedEmbedder::new(inner.clone());

        let first = cache.embed("some text").await.unwrap();
        let second = cache.embed("some text").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_cached_embedder_expires() {
        let inner = Arc::new(HashEmbedder::new(8));
        let cache = CachedEmbedder::new(inner.clone()).with_ttl(Duration::zero());

        cache.embed("some text").await.unwrap();
        cache.embed("some text").await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        cache.cleanup().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_retrying_embedder_recovers_from_transient() {
        let flaky = Arc::new(FlakyEmbedder::new(8, 2));
        let retrying = RetryingEmbedder::new(
            flaky,
            RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
                backoff_factor: 1.0,
            },
        );

        let vector = retrying.embed("text").await.unwrap();
        assert_eq!(vector.len(), 8);
    }

    #[tokio::test]
    async fn test_retrying_embedder_gives_up() {
        let flaky = Arc::new(FlakyEmbedder::new(8, 5));
        let retrying = RetryingEmbedder::new(
            flaky,
            RetryConfig {
                max_retries: 1,
                base_delay_ms: 1,
                backoff_factor: 1.0,
            },
        );

        let err = retrying.embed("text").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        struct AlwaysPermanent;

        #[async_trait]
        impl EmbeddingProvider for AlwaysPermanent {
            async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                Err(Error::permanent("embedding", "401 unauthorized"))
            }
            fn dimension(&self) -> usize {
                8
            }
        }

        let retrying = RetryingEmbedder::new(Arc::new(AlwaysPermanent), RetryConfig::default());
        let err = retrying.embed("text").await.unwrap_err();
        assert!(matches!(err, Error::UpstreamPermanent { .. }));
    }
}
