//! Rerank client.
//!
//! Re-orders retrieved chunks by relevance through a remote rerank
//! endpoint. Shares the transport, cache, health flag and worker pool with
//! the embedding client. Any failure, timeout or disabled state falls back
//! to the identity ranking so retrieval quality degrades instead of the
//! pipeline breaking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::cache::SmartCache;
use crate::config::{NetworkConfig, RerankConfig};
use crate::embedding::ApiTransport;
use crate::error::RagError;
use crate::hash::sha256_hex;

// ============================================================================
// Reranker
// ============================================================================

/// Cache-first reranking with identity fallback.
pub struct Reranker {
    transport: Arc<dyn ApiTransport>,
    cache: Arc<SmartCache>,
    config: RerankConfig,
    network: NetworkConfig,
    network_healthy: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
}

impl Reranker {
    pub fn new(
        transport: Arc<dyn ApiTransport>,
        cache: Arc<SmartCache>,
        config: RerankConfig,
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

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Rank `documents` against `query`. Returns `(index, score)` pairs,
    /// best first, at most `top_k`. Never fails: the identity ranking is
    /// the floor.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Vec<(usize, f32)> {
        if !self.config.enabled || documents.is_empty() || query.trim().is_empty() {
            return identity_ranking(documents.len(), top_k);
        }

        let budget = Duration::from_secs(self.config.timeout_secs);
        match tokio::time::timeout(budget, self.rerank_uncapped(query, documents, top_k)).await {
            Ok(ranking) => ranking,
            Err(_) => {
                tracing::warn!("rerank timed out after {:?}", budget);
                identity_ranking(documents.len(), top_k)
            }
        }
    }

    async fn rerank_uncapped(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Vec<(usize, f32)> {
        let key = rerank_cache_key(&self.config.model, query, documents, top_k);
        if let Some(ranking) = self.cache.get::<Vec<(usize, f32)>>(&key) {
            return ranking;
        }

        if self.network.enable_fallback && !self.network_healthy.load(Ordering::Relaxed) {
            tracing::debug!("network unhealthy, skipping rerank request");
            return identity_ranking(documents.len(), top_k);
        }

        let Ok(_permit) = self.semaphore.acquire().await else {
            return identity_ranking(documents.len(), top_k);
        };

        match self.request_with_retry(query, documents, top_k).await {
            Ok(ranking) => {
                let ranking = sanitize_ranking(ranking, documents.len(), top_k);
                let tags = vec!["rerank".to_string(), self.config.model.clone()];
                if let Err(e) =
                    self.cache
                        .put(&key, &ranking, Some(self.config.cache_ttl_secs), &tags)
                {
                    tracing::warn!("failed to cache rerank result: {}", e);
                }
                ranking
            }
            Err(e) => {
                tracing::warn!("rerank request failed: {}", e);
                identity_ranking(documents.len(), top_k)
            }
        }
    }

    /// Same retry policy as the embedding client, including the escalating
    /// per-attempt budget.
    async fn request_with_retry(
        &self,
        query: &str,
        documents: &[String],
        top_k: usize,
    ) -> Result<Vec<(usize, f32)>, RagError> {
        let mut attempt: u32 = 0;
        loop {
            let budget = crate::embedding::attempt_budget(attempt);
            let outcome = tokio::time::timeout(
                budget,
                self.transport
                    .rerank(&self.config.model, query, documents, top_k),
            )
            .await;
            let err = match outcome {
                Ok(Ok(ranking)) => {
                    self.network_healthy.store(true, Ordering::Relaxed);
                    return Ok(ranking);
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

// ============================================================================
// Helper Functions
// ============================================================================

/// Input order, unit scores.
fn identity_ranking(document_count: usize, top_k: usize) -> Vec<(usize, f32)> {
    (0..document_count.min(top_k)).map(|i| (i, 1.0)).collect()
}

/// Drop out-of-range indices, order by score, truncate.
fn sanitize_ranking(
    mut ranking: Vec<(usize, f32)>,
    document_count: usize,
    top_k: usize,
) -> Vec<(usize, f32)> {
    ranking.retain(|(i, _)| *i < document_count);
    ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranking.truncate(top_k);
    ranking
}

/// Cache key over (model, query, documents, top_k).
fn rerank_cache_key(model: &str, query: &str, documents: &[String], top_k: usize) -> String {
    let docs_digest = sha256_hex(&documents.join("\u{1f}"));
    format!(
        "rerank:{}:{}:{}:{}",
        model,
        sha256_hex(query),
        docs_digest,
        top_k
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, SmartCache};
    use crate::embedding::tests::MockTransport;

    fn reranker_with(transport: Arc<MockTransport>, enabled: bool, healthy: bool) -> Reranker {
        let config = RerankConfig {
            enabled,
            ..RerankConfig::default()
        };
        Reranker::new(
            transport,
            Arc::new(SmartCache::new(&CacheConfig::default())),
            config,
            NetworkConfig::default(),
            Arc::new(AtomicBool::new(healthy)),
            Arc::new(Semaphore::new(4)),
        )
    }

    fn docs(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("文档{}", i)).collect()
    }

    #[tokio::test]
    async fn test_rerank_orders_by_score() {
        let transport = Arc::new(MockTransport::ok());
        let reranker = reranker_with(transport, true, true);

        let ranking = reranker.rerank("查询", &docs(3), 3).await;
        assert_eq!(ranking.len(), 3);
        assert_eq!(ranking[0].0, 0);
        assert!(ranking[0].1 >= ranking[1].1);
        assert!(ranking[1].1 >= ranking[2].1);
    }

    #[tokio::test]
    async fn test_disabled_returns_identity() {
        let transport = Arc::new(MockTransport::ok());
        let reranker = reranker_with(transport.clone(), false, true);

        let ranking = reranker.rerank("查询", &docs(4), 2).await;
        assert_eq!(ranking, vec![(0, 1.0), (1, 1.0)]);
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_returns_identity() {
        let transport = Arc::new(MockTransport::failing(400));
        let reranker = reranker_with(transport, true, true);

        let ranking = reranker.rerank("查询", &docs(3), 3).await;
        assert_eq!(ranking, vec![(0, 1.0), (1, 1.0), (2, 1.0)]);
    }

    #[tokio::test]
    async fn test_degraded_mode_returns_identity_without_calls() {
        let transport = Arc::new(MockTransport::ok());
        let reranker = reranker_with(transport.clone(), true, false);

        let ranking = reranker.rerank("查询", &docs(2), 2).await;
        assert_eq!(ranking, vec![(0, 1.0), (1, 1.0)]);
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_documents() {
        let transport = Arc::new(MockTransport::ok());
        let reranker = reranker_with(transport.clone(), true, true);

        assert!(reranker.rerank("查询", &[], 5).await.is_empty());
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_result_cached() {
        let transport = Arc::new(MockTransport::ok());
        let reranker = reranker_with(transport.clone(), true, true);

        let documents = docs(3);
        let first = reranker.rerank("查询", &documents, 3).await;
        let second = reranker.rerank("查询", &documents, 3).await;
        assert_eq!(first, second);
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sanitize_drops_bad_indices() {
        let ranking = sanitize_ranking(vec![(5, 0.9), (1, 0.8), (0, 0.7)], 3, 10);
        assert_eq!(ranking, vec![(1, 0.8), (0, 0.7)]);
    }

    #[test]
    fn test_cache_key_sensitive_to_top_k() {
        let documents = docs(2);
        let a = rerank_cache_key("m", "q", &documents, 3);
        let b = rerank_cache_key("m", "q", &documents, 5);
        assert_ne!(a, b);
    }
}
