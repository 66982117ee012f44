//! Embedding client.
//!
//! Turns text into vectors through a remote OpenAI-compatible embeddings
//! endpoint. Results flow through the shared cache; every public call is
//! bounded by a hard wall-clock timeout and degrades to `None` rather than
//! blocking a caller.
//!
//! ## Usage
//! ```rust,ignore
//! let vector = client.embed("主角走进了青云城。").await; // Option<Vec<f32>>
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::cache::SmartCache;
use crate::config::{ApiConfig, EmbeddingConfig, NetworkConfig};
use crate::error::RagError;
use crate::hash::sha256_hex;

/// Batch calls get 5 seconds per text, capped at this many seconds.
const BATCH_TIMEOUT_CAP_SECS: u64 = 30;
const BATCH_TIMEOUT_PER_TEXT_SECS: u64 = 5;

/// Per-attempt budget: base plus an escalation per retry, so later attempts
/// get more room when the endpoint is slow rather than down.
pub(crate) const REQUEST_TIMEOUT_BASE_SECS: u64 = 30;
pub(crate) const REQUEST_TIMEOUT_STEP_SECS: u64 = 10;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Budget for retry attempt `attempt` (0-based).
pub(crate) fn attempt_budget(attempt: u32) -> Duration {
    Duration::from_secs(REQUEST_TIMEOUT_BASE_SECS + REQUEST_TIMEOUT_STEP_SECS * attempt as u64)
}

// ============================================================================
// ApiTransport Trait
// ============================================================================

/// Raw access to the remote model endpoints. One implementation speaks
/// HTTP; tests substitute their own.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// One vector per input, in input order.
    async fn embeddings(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>, RagError>;

    /// `(document index, relevance score)` pairs, best first.
    async fn rerank(
        &self,
        model: &str,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>, RagError>;
}

// ============================================================================
// HttpTransport
// ============================================================================

/// reqwest-backed transport for OpenAI-compatible endpoints.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(api: &ApiConfig) -> Result<Self, RagError> {
        // Attempt-level budgets live in the clients; only connection
        // establishment is capped here.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| RagError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            api_key: api.api_key.clone(),
        })
    }

    /// Map a non-success response to the error taxonomy.
    async fn error_from_response(response: reqwest::Response) -> RagError {
        let status = response.status().as_u16();
        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            return RagError::RateLimited { retry_after_secs };
        }
        let message = response.text().await.unwrap_or_default();
        RagError::Client { status, message }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
    return_documents: bool,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultData>,
}

#[derive(Debug, Deserialize)]
struct RerankResultData {
    index: usize,
    relevance_score: f32,
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn embeddings(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let request = EmbeddingsRequest {
            model,
            input: inputs,
            encoding_format: "float",
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| RagError::Network(format!("invalid embeddings response: {}", e)))?;

        let mut data = body.data;
        data.sort_by_key(|d| d.index);
        if data.len() != inputs.len() {
            return Err(RagError::Client {
                status: 200,
                message: format!("expected {} embeddings, got {}", inputs.len(), data.len()),
            });
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    async fn rerank(
        &self,
        model: &str,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>, RagError> {
        let request = RerankRequest {
            model,
            query,
            documents,
            top_n: top_k,
            return_documents: false,
        };

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body: RerankResponse = response
            .json()
            .await
            .map_err(|e| RagError::Network(format!("invalid rerank response: {}", e)))?;

        Ok(body
            .results
            .into_iter()
            .map(|r| (r.index, r.relevance_score))
            .collect())
    }
}

// ============================================================================
// EmbeddingClient
// ============================================================================

/// Cache-first embedding access with retry, backoff and degraded mode.
pub struct EmbeddingClient {
    transport: Arc<dyn ApiTransport>,
    cache: Arc<SmartCache>,
    config: EmbeddingConfig,
    network: NetworkConfig,
    network_healthy: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
}

impl EmbeddingClient {
    pub fn new(
        transport: Arc<dyn ApiTransport>,
        cache: Arc<SmartCache>,
        config: EmbeddingConfig,
        network: NetworkConfig,
        network_healthy: Arc<AtomicBool>,
        semaphore: Arc<Semaphore>,
    ) -> Self {
        Self {
            transport,
            cache,
            config,
            network,
            network_healthy,
            semaphore,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Embed one text. `None` on any failure or timeout; never blocks past
    /// the configured wall-clock budget.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let budget = Duration::from_secs(self.config.single_timeout_secs);
        match tokio::time::timeout(budget, self.embed_uncapped(text)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("embedding timed out after {:?}", budget);
                None
            }
        }
    }

    /// Embed many texts concurrently (bounded by the worker semaphore).
    /// The result always has one slot per input.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        if texts.is_empty() {
            return vec![];
        }
        let budget = Duration::from_secs(
            (BATCH_TIMEOUT_PER_TEXT_SECS * texts.len() as u64).min(BATCH_TIMEOUT_CAP_SECS),
        );
        let work = futures::future::join_all(texts.iter().map(|t| self.embed_uncapped(t)));
        match tokio::time::timeout(budget, work).await {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!(
                    "batch embedding of {} texts timed out after {:?}",
                    texts.len(),
                    budget
                );
                vec![None; texts.len()]
            }
        }
    }

    async fn embed_uncapped(&self, text: &str) -> Option<Vec<f32>> {
        if text.trim().is_empty() {
            return None;
        }

        let key = embedding_cache_key(&self.config.model, text);
        if let Some(vector) = self.cache.get::<Vec<f32>>(&key) {
            return Some(vector);
        }

        // Degraded mode: known-bad network with fallback enabled means the
        // transport is not touched at all.
        if self.network.enable_fallback && !self.network_healthy.load(Ordering::Relaxed) {
            tracing::debug!("network unhealthy, skipping embedding request");
            return None;
        }

        let _permit = self.semaphore.acquire().await.ok()?;
        let input = vec![text.to_string()];

        match self.request_with_retry(&input).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                let vector = vectors.swap_remove(0);
                let tags = vec!["embedding".to_string(), self.config.model.clone()];
                if let Err(e) =
                    self.cache
                        .put(&key, &vector, Some(self.config.cache_ttl_secs), &tags)
                {
                    tracing::warn!("failed to cache embedding: {}", e);
                }
                Some(vector)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("embedding request failed: {}", e);
                None
            }
        }
    }

    /// Retry policy: 429 honors Retry-After, 5xx and network errors back
    /// off exponentially, other 4xx fails fast. Network-level failures flip
    /// the health flag; any success restores it. Each attempt runs under an
    /// escalating wall-clock budget.
    async fn request_with_retry(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let mut attempt: u32 = 0;
        loop {
            let budget = attempt_budget(attempt);
            let outcome = tokio::time::timeout(
                budget,
                self.transport.embeddings(&self.config.model, inputs),
            )
            .await;
            let err = match outcome {
                Ok(Ok(vectors)) => {
                    self.network_healthy.store(true, Ordering::Relaxed);
                    return Ok(vectors);
                }
                Ok(Err(e)) => e,
                Err(_) => RagError::Timeout(budget),
            };

            match &err {
                RagError::RateLimited { retry_after_secs } => {
                    if attempt >= self.network.max_retries {
                        return Err(err);
                    }
                    tracing::warn!("rate limited, waiting {}s", retry_after_secs);
                    tokio::time::sleep(Duration::from_secs(*retry_after_secs)).await;
                }
                RagError::Client { status, .. } if *status >= 500 => {
                    if attempt >= self.network.max_retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tracing::warn!("server error {}, backing off {:?}", status, backoff);
                    tokio::time::sleep(backoff).await;
                }
                RagError::Network(_) | RagError::Timeout(_) => {
                    self.network_healthy.store(false, Ordering::Relaxed);
                    if attempt >= self.network.max_retries {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    tracing::warn!("network error ({}), backing off {:?}", err, backoff);
                    tokio::time::sleep(backoff).await;
                }
                _ => return Err(err),
            }
            attempt += 1;
        }
    }
}

/// Cache key for one (model, text) pair.
fn embedding_cache_key(model: &str, text: &str) -> String {
    format!("embedding:{}:{}", model, sha256_hex(text))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic transport that counts calls.
    pub(crate) struct MockTransport {
        pub calls: AtomicUsize,
        pub fail_with: Option<u16>,
    }

    impl MockTransport {
        pub(crate) fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: None,
            }
        }

        pub(crate) fn failing(status: u16) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_with: Some(status),
            }
        }

        /// Stable pseudo-vector derived from the text.
        pub(crate) fn vector_for(text: &str) -> Vec<f32> {
            let mut seed = 0u32;
            for b in text.bytes() {
                seed = seed.wrapping_mul(31).wrapping_add(b as u32);
            }
            (0..8u32)
                .map(|i| ((seed.wrapping_add(i.wrapping_mul(2654435761)) % 1000) as f32) / 1000.0)
                .collect()
        }
    }

    #[async_trait]
    impl ApiTransport for MockTransport {
        async fn embeddings(
            &self,
            _model: &str,
            inputs: &[String],
        ) -> Result<Vec<Vec<f32>>, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.fail_with {
                return Err(RagError::Client {
                    status,
                    message: "mock failure".into(),
                });
            }
            Ok(inputs.iter().map(|t| Self::vector_for(t)).collect())
        }

        async fn rerank(
            &self,
            _model: &str,
            _query: &str,
            documents: &[String],
            top_k: usize,
        ) -> Result<Vec<(usize, f32)>, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = self.fail_with {
                return Err(RagError::Client {
                    status,
                    message: "mock failure".into(),
                });
            }
            Ok((0..documents.len().min(top_k))
                .map(|i| (i, 1.0 - i as f32 * 0.1))
                .collect())
        }
    }

    fn client_with(transport: Arc<MockTransport>, healthy: bool) -> EmbeddingClient {
        EmbeddingClient::new(
            transport,
            Arc::new(SmartCache::new(&CacheConfig::default())),
            EmbeddingConfig::default(),
            NetworkConfig::default(),
            Arc::new(AtomicBool::new(healthy)),
            Arc::new(Semaphore::new(4)),
        )
    }

    /// Transport that never responds.
    struct StalledTransport;

    #[async_trait]
    impl ApiTransport for StalledTransport {
        async fn embeddings(
            &self,
            _model: &str,
            _inputs: &[String],
        ) -> Result<Vec<Vec<f32>>, RagError> {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
            Ok(vec![])
        }

        async fn rerank(
            &self,
            _model: &str,
            _query: &str,
            _documents: &[String],
            _top_k: usize,
        ) -> Result<Vec<(usize, f32)>, RagError> {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
            Ok(vec![])
        }
    }

    #[test]
    fn test_attempt_budget_escalates() {
        assert_eq!(attempt_budget(0), Duration::from_secs(30));
        assert_eq!(attempt_budget(1), Duration::from_secs(40));
        assert_eq!(attempt_budget(2), Duration::from_secs(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_request_cut_off_per_attempt() {
        let healthy = Arc::new(AtomicBool::new(true));
        let client = EmbeddingClient::new(
            Arc::new(StalledTransport),
            Arc::new(SmartCache::new(&CacheConfig::default())),
            EmbeddingConfig::default(),
            NetworkConfig {
                max_retries: 0,
                enable_fallback: true,
            },
            Arc::clone(&healthy),
            Arc::new(Semaphore::new(4)),
        );

        let err = client
            .request_with_retry(&["文".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Timeout(_)));
        assert!(!healthy.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_embed_returns_vector() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(transport.clone(), true);

        let vector = client.embed("青云城在山顶。").await;
        assert_eq!(vector, Some(MockTransport::vector_for("青云城在山顶。")));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embed_hits_cache_second_time() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(transport.clone(), true);

        let first = client.embed("重复文本").await;
        let second = client.embed("重复文本").await;
        assert_eq!(first, second);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_degraded_mode_never_touches_transport() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(transport.clone(), false);

        assert_eq!(client.embed("任何文本").await, None);
        let batch = client
            .embed_batch(&["一".to_string(), "二".to_string()])
            .await;
        assert_eq!(batch, vec![None, None]);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_error_fails_fast() {
        let transport = Arc::new(MockTransport::failing(401));
        let client = client_with(transport.clone(), true);

        assert_eq!(client.embed("文本").await, None);
        // A 401 must not be retried.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_text_skipped() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(transport.clone(), true);

        assert_eq!(client.embed("   ").await, None);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_slot_per_input() {
        let transport = Arc::new(MockTransport::ok());
        let client = client_with(transport, true);

        let texts = vec!["一".to_string(), "".to_string(), "三".to_string()];
        let batch = client.embed_batch(&texts).await;
        assert_eq!(batch.len(), 3);
        assert!(batch[0].is_some());
        assert!(batch[1].is_none()); // empty input
        assert!(batch[2].is_some());
    }

    #[test]
    fn test_cache_key_separates_models() {
        let a = embedding_cache_key("model-a", "同一文本");
        let b = embedding_cache_key("model-b", "同一文本");
        assert_ne!(a, b);
        assert!(a.starts_with("embedding:model-a:"));
    }
}
