//! RAG service facade.
//!
//! Wires the chunker, embedding client, reranker, vector store, cache and
//! reference detector into one entry point. The editor layer talks to this
//! type only; everything below it is replaceable through the transport
//! seam.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::cache::{CacheStats, SmartCache};
use crate::chunker::{sentence_chunker, Chunker, TextChunk};
use crate::codex::{Codex, CodexEntry};
use crate::config::{ModeParams, RagConfig, SearchModes};
use crate::detector::{DetectedReference, DetectionStats, ReferenceDetector};
use crate::embedding::{ApiTransport, EmbeddingClient, HttpTransport};
use crate::error::{RagError, RagResult};
use crate::hash::sha256_hex;
use crate::rerank::Reranker;
use crate::segment::KeywordExtractor;
use crate::store::{IndexStats, SearchResult, VectorStore};

// ============================================================================
// SearchMode
// ============================================================================

/// Retrieval presets trading recall against latency and context size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Fast,
    Balanced,
    Full,
}

impl SearchMode {
    /// Tuning row for this mode from the configured table.
    pub fn params(&self, modes: &SearchModes) -> ModeParams {
        match self {
            SearchMode::Fast => modes.fast,
            SearchMode::Balanced => modes.balanced,
            SearchMode::Full => modes.full,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Fast => "fast",
            SearchMode::Balanced => "balanced",
            SearchMode::Full => "full",
        }
    }
}

impl FromStr for SearchMode {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast" => Ok(SearchMode::Fast),
            "balanced" => Ok(SearchMode::Balanced),
            "full" => Ok(SearchMode::Full),
            other => Err(RagError::Validation(format!(
                "unknown search mode '{}' (expected fast, balanced or full)",
                other
            ))),
        }
    }
}

/// Combined statistics for the status view.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub index: IndexStats,
    pub cache: CacheStats,
    pub detection: DetectionStats,
    pub codex_entries: usize,
    pub network_healthy: bool,
}

// ============================================================================
// RagService
// ============================================================================

/// The full retrieval pipeline behind one handle.
pub struct RagService {
    config: RagConfig,
    chunker: Box<dyn Chunker>,
    cache: Arc<SmartCache>,
    embedding: EmbeddingClient,
    reranker: Reranker,
    store: VectorStore,
    detector: ReferenceDetector,
    codex: RwLock<Codex>,
    keywords: KeywordExtractor,
    network_healthy: Arc<AtomicBool>,
}

impl RagService {
    /// Production constructor: HTTP transport, on-disk cache and store
    /// under the configured data directory.
    pub fn new(config: RagConfig) -> RagResult<Self> {
        let transport = Arc::new(HttpTransport::new(&config.api)?);
        Self::with_transport(config, transport)
    }

    /// Constructor with an injected transport. Tests use this with a mock.
    pub fn with_transport(config: RagConfig, transport: Arc<dyn ApiTransport>) -> RagResult<Self> {
        config.validate()?;

        let data_dir = config.data_dir();
        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir).map_err(|e| {
                RagError::Storage(format!("failed to create data directory: {}", e))
            })?;
        }

        let cache = Arc::new(SmartCache::with_disk(
            &config.cache,
            &data_dir.join("cache.db"),
        )?);
        let store = VectorStore::open(&data_dir.join("vectors.db"))?;

        let network_healthy = Arc::new(AtomicBool::new(true));
        let semaphore = Arc::new(Semaphore::new(config.worker_count));

        let embedding = EmbeddingClient::new(
            Arc::clone(&transport),
            Arc::clone(&cache),
            config.embedding.clone(),
            config.network,
            Arc::clone(&network_healthy),
            Arc::clone(&semaphore),
        );
        let reranker = Reranker::new(
            transport,
            Arc::clone(&cache),
            config.rerank.clone(),
            config.network,
            Arc::clone(&network_healthy),
            semaphore,
        );

        Ok(Self {
            detector: ReferenceDetector::new(config.detection),
            chunker: sentence_chunker(config.chunking),
            cache,
            embedding,
            reranker,
            store,
            codex: RwLock::new(Codex::new()),
            keywords: KeywordExtractor::new(),
            network_healthy,
            config,
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn is_network_healthy(&self) -> bool {
        self.network_healthy.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Indexing
    // ------------------------------------------------------------------

    /// Chunk, embed and store a document, replacing any previous version.
    /// All-or-nothing: returns `Ok(false)` without touching the store when
    /// any chunk fails to embed.
    pub async fn index_document(&self, document_id: &str, text: &str) -> RagResult<bool> {
        if document_id.trim().is_empty() {
            return Err(RagError::Validation("document_id is empty".into()));
        }
        self.index_with_hash(document_id, text, &sha256_hex(text))
            .await
    }

    /// Index only when the content hash differs from the stored one.
    /// Returns `Ok(false)` when the document is unchanged or indexing
    /// failed.
    pub async fn index_document_if_changed(
        &self,
        document_id: &str,
        text: &str,
    ) -> RagResult<bool> {
        if document_id.trim().is_empty() {
            return Err(RagError::Validation("document_id is empty".into()));
        }
        let content_hash = sha256_hex(text);
        if !self.store.has_document_changed(document_id, &content_hash)? {
            tracing::debug!("document {} unchanged, skipping", document_id);
            return Ok(false);
        }
        self.index_with_hash(document_id, text, &content_hash).await
    }

    async fn index_with_hash(
        &self,
        document_id: &str,
        text: &str,
        content_hash: &str,
    ) -> RagResult<bool> {
        let chunks = self.chunker.chunk(text, document_id);
        if chunks.is_empty() {
            // Nothing to index; drop any stale copy.
            self.store.delete_document(document_id)?;
            return Ok(true);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedding.embed_batch(&texts).await;

        let mut rows: Vec<(TextChunk, Vec<f32>)> = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.into_iter().zip(vectors) {
            match vector {
                Some(v) => rows.push((chunk, v)),
                None => {
                    tracing::warn!(
                        "embedding failed for chunk {} of {}, aborting index",
                        rows.len(),
                        document_id
                    );
                    return Ok(false);
                }
            }
        }

        self.store
            .replace_document(document_id, content_hash, self.embedding.model(), &rows)?;
        Ok(true)
    }

    /// Remove a document from the index. Returns removed chunk count.
    pub fn delete_document(&self, document_id: &str) -> RagResult<usize> {
        self.store.delete_document(document_id)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Semantic search with rerank. Falls back to keyword text search when
    /// no query embedding is available (offline, rate-limited, timed out).
    pub async fn search(&self, query: &str, mode: SearchMode) -> RagResult<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(vec![]);
        }
        let started = Instant::now();
        let params = mode.params(&self.config.modes);

        let mut results = match self.embedding.embed(query).await {
            Some(vector) => {
                self.store
                    .similarity_search(&vector, params.limit, params.min_similarity)?
            }
            None => {
                tracing::info!("query embedding unavailable, using text search");
                self.text_search(query, params.limit)?
            }
        };

        if self.reranker.is_enabled() && results.len() > 1 {
            let documents: Vec<String> = results.iter().map(|r| r.chunk_text.clone()).collect();
            let ranking = self.reranker.rerank(query, &documents, documents.len()).await;
            results = apply_ranking(results, &ranking);
        }

        if let Err(e) = self
            .store
            .log_search(query, mode.as_str(), results.len(), started.elapsed())
        {
            tracing::warn!("failed to log search: {}", e);
        }
        Ok(results)
    }

    /// Keyword-only search, no network involved.
    pub fn text_search(&self, query: &str, limit: usize) -> RagResult<Vec<SearchResult>> {
        let mut keywords = self.keywords.extract_keywords(query, 5);
        if keywords.is_empty() {
            keywords.push(query.trim().to_string());
        }
        self.store.fast_text_search(&keywords, limit)
    }

    /// Assemble a ready-to-inject context block for a prompt. Text-search
    /// based so it stays fast and works offline; output is capped at the
    /// mode's character budget.
    pub fn search_context(&self, query: &str, mode: SearchMode) -> RagResult<String> {
        if query.trim().is_empty() {
            return Ok(String::new());
        }
        let started = Instant::now();
        let params = mode.params(&self.config.modes);
        let hits = self.text_search(query, params.limit)?;

        let mut context = String::new();
        for hit in &hits {
            if !context.is_empty() {
                context.push_str("\n\n");
            }
            context.push_str(&hit.chunk_text);
            if context.chars().count() >= params.char_budget {
                break;
            }
        }

        if let Err(e) = self
            .store
            .log_search(query, mode.as_str(), hits.len(), started.elapsed())
        {
            tracing::warn!("failed to log search: {}", e);
        }
        Ok(context.chars().take(params.char_budget).collect())
    }

    // ------------------------------------------------------------------
    // Reference Detection / Codex
    // ------------------------------------------------------------------

    /// Detect codex entry references in `text`.
    pub fn detect_references(&self, text: &str) -> RagResult<Vec<DetectedReference>> {
        let codex = self
            .codex
            .read()
            .map_err(|e| RagError::Storage(format!("codex lock error: {}", e)))?;
        Ok(self.detector.detect(text, &codex))
    }

    /// Replace the whole codex.
    pub fn set_codex(&self, codex: Codex) -> RagResult<()> {
        let mut guard = self
            .codex
            .write()
            .map_err(|e| RagError::Storage(format!("codex lock error: {}", e)))?;
        *guard = codex;
        Ok(())
    }

    pub fn add_codex_entry(&self, entry: CodexEntry) -> RagResult<()> {
        let mut guard = self
            .codex
            .write()
            .map_err(|e| RagError::Storage(format!("codex lock error: {}", e)))?;
        guard.add_entry(entry);
        Ok(())
    }

    pub fn remove_codex_entry(&self, id: &str) -> RagResult<bool> {
        let mut guard = self
            .codex
            .write()
            .map_err(|e| RagError::Storage(format!("codex lock error: {}", e)))?;
        Ok(guard.remove_entry(id))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub fn stats(&self) -> RagResult<ServiceStats> {
        let codex_entries = self
            .codex
            .read()
            .map_err(|e| RagError::Storage(format!("codex lock error: {}", e)))?
            .len();
        Ok(ServiceStats {
            index: self.store.stats()?,
            cache: self.cache.stats(),
            detection: self.detector.stats(),
            codex_entries,
            network_healthy: self.is_network_healthy(),
        })
    }

    /// Drop cached vectors and rerank results for one model. Used after a
    /// model upgrade so stale vectors never mix with new ones.
    pub fn invalidate_model_cache(&self, model: &str) -> usize {
        self.cache.invalidate_by_tags(&[model.to_string()])
    }

    /// Evict expired cache entries from both tiers.
    pub fn cleanup_cache(&self) -> usize {
        self.cache.cleanup_expired()
    }

    /// Wipe the index and the cache.
    pub fn clear_all(&self) -> RagResult<()> {
        self.store.clear()?;
        self.cache.clear();
        Ok(())
    }

    /// Compact the vector database.
    pub fn optimize(&self) -> RagResult<()> {
        self.store.optimize()
    }

    /// Fire-and-forget indexing on the runtime; the handle resolves to the
    /// same result `index_document` would return.
    pub fn spawn_index_document(
        self: &Arc<Self>,
        document_id: impl Into<String>,
        text: impl Into<String>,
    ) -> tokio::task::JoinHandle<RagResult<bool>> {
        let service = Arc::clone(self);
        let document_id = document_id.into();
        let text = text.into();
        tokio::spawn(async move { service.index_document(&document_id, &text).await })
    }

    /// Search on the runtime without holding the caller.
    pub fn spawn_search(
        self: &Arc<Self>,
        query: impl Into<String>,
        mode: SearchMode,
    ) -> tokio::task::JoinHandle<RagResult<Vec<SearchResult>>> {
        let service = Arc::clone(self);
        let query = query.into();
        tokio::spawn(async move { service.search(&query, mode).await })
    }

    /// Periodic cache maintenance on the runtime.
    pub fn spawn_cache_maintenance(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let removed = service.cleanup_cache();
                if removed > 0 {
                    tracing::debug!("cache maintenance evicted {} expired entries", removed);
                }
            }
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Reorder `results` by a `(index, score)` ranking; entries the ranking
/// skipped keep their relative order at the tail.
fn apply_ranking(results: Vec<SearchResult>, ranking: &[(usize, f32)]) -> Vec<SearchResult> {
    let mut slots: Vec<Option<SearchResult>> = results.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    for &(index, score) in ranking {
        if let Some(slot) = slots.get_mut(index) {
            if let Some(mut result) = slot.take() {
                result.rerank_score = Some(score);
                ordered.push(result);
            }
        }
    }
    ordered.extend(slots.into_iter().flatten());
    ordered
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codex::CodexEntryType;
    use crate::embedding::tests::MockTransport;
    use tempfile::TempDir;

    fn test_service(transport: MockTransport) -> (TempDir, RagService) {
        let dir = TempDir::new().unwrap();
        let config = RagConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..RagConfig::default()
        };
        let service = RagService::with_transport(config, Arc::new(transport)).unwrap();
        (dir, service)
    }

    #[tokio::test]
    async fn test_index_document_produces_expected_chunks() {
        let (_dir, service) = test_service(MockTransport::ok());

        let text = "字".repeat(1000);
        assert!(service.index_document("chapter-1", &text).await.unwrap());

        let stats = service.stats().unwrap();
        assert_eq!(stats.index.document_count, 1);
        assert_eq!(stats.index.chunk_count, 5);
    }

    #[tokio::test]
    async fn test_index_empty_document_writes_nothing() {
        let (_dir, service) = test_service(MockTransport::ok());

        assert!(service.index_document("empty", "   ").await.unwrap());
        let stats = service.stats().unwrap();
        assert_eq!(stats.index.document_count, 0);
        assert_eq!(stats.index.chunk_count, 0);
    }

    #[tokio::test]
    async fn test_index_failure_leaves_no_partial_state() {
        let (_dir, service) = test_service(MockTransport::failing(400));

        let text = "字".repeat(1000);
        assert!(!service.index_document("chapter-1", &text).await.unwrap());

        let stats = service.stats().unwrap();
        assert_eq!(stats.index.document_count, 0);
        assert_eq!(stats.index.chunk_count, 0);
    }

    #[tokio::test]
    async fn test_index_if_changed_skips_unchanged() {
        let (_dir, service) = test_service(MockTransport::ok());

        let text = "主角走进了青云城。".repeat(30);
        assert!(service
            .index_document_if_changed("chapter-1", &text)
            .await
            .unwrap());
        assert!(!service
            .index_document_if_changed("chapter-1", &text)
            .await
            .unwrap());

        let changed = format!("{}后来他离开了。", text);
        assert!(service
            .index_document_if_changed("chapter-1", &changed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_search_finds_indexed_text() {
        let (_dir, service) = test_service(MockTransport::ok());

        service
            .index_document("doc-a", "李四在青云城的客栈里休息。")
            .await
            .unwrap();
        service
            .index_document("doc-b", "北方的雪原一望无际。")
            .await
            .unwrap();

        // The mock embeds identical text to identical vectors, so querying
        // with an indexed chunk's exact text must rank it first.
        let results = service
            .search("李四在青云城的客栈里休息。", SearchMode::Balanced)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].document_id, "doc-a");
        assert!(results[0].ranking_score() > 0.0);
        assert!(results[0].rerank_score.is_some());

        let stats = service.stats().unwrap();
        assert_eq!(stats.index.search_count, 1);
    }

    #[tokio::test]
    async fn test_search_falls_back_to_text_when_embedding_fails() {
        let dir = TempDir::new().unwrap();
        let config = RagConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..RagConfig::default()
        };

        // Index with a working transport.
        let service =
            RagService::with_transport(config.clone(), Arc::new(MockTransport::ok())).unwrap();
        service
            .index_document("doc-a", "李四在青云城的客栈里休息。")
            .await
            .unwrap();
        drop(service);

        // Reopen over the same data with a transport that always fails.
        let service =
            RagService::with_transport(config, Arc::new(MockTransport::failing(400))).unwrap();
        let results = service.search("青云城", SearchMode::Fast).await.unwrap();
        assert!(!results.is_empty());
        assert!(results[0].chunk_text.contains("青云城"));
    }

    #[tokio::test]
    async fn test_search_context_respects_budget() {
        let (_dir, service) = test_service(MockTransport::ok());

        let text = format!("青云城{}", "字".repeat(240));
        service.index_document("doc-a", &text).await.unwrap();

        let context = service
            .search_context("青云城", SearchMode::Fast)
            .unwrap();
        assert!(!context.is_empty());
        assert!(context.chars().count() <= 400);

        // Context assembly counts as a search.
        let stats = service.stats().unwrap();
        assert_eq!(stats.index.search_count, 1);
    }

    #[tokio::test]
    async fn test_custom_mode_params_are_honored() {
        let dir = TempDir::new().unwrap();
        let mut config = RagConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..RagConfig::default()
        };
        config.modes.fast.limit = 1;
        config.modes.fast.char_budget = 30;
        let service =
            RagService::with_transport(config, Arc::new(MockTransport::ok())).unwrap();

        // Two chunks, each mentioning the keyword.
        service
            .index_document("doc-a", &"青云城的故事。".repeat(60))
            .await
            .unwrap();

        let hits = service.text_search("青云城", 10).unwrap();
        assert!(hits.len() > 1);

        let context = service.search_context("青云城", SearchMode::Fast).unwrap();
        assert!(context.chars().count() <= 30);
    }

    #[tokio::test]
    async fn test_spawn_index_and_search() {
        let (_dir, service) = test_service(MockTransport::ok());
        let service = Arc::new(service);

        let indexed = service
            .spawn_index_document("doc-a", "李四在青云城的客栈里休息。")
            .await
            .unwrap()
            .unwrap();
        assert!(indexed);

        let results = service
            .spawn_search("李四在青云城的客栈里休息。", SearchMode::Balanced)
            .await
            .unwrap()
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].document_id, "doc-a");
    }

    #[tokio::test]
    async fn test_detect_references_through_service() {
        let (_dir, service) = test_service(MockTransport::ok());

        service
            .add_codex_entry(CodexEntry::new("c1", "李四", CodexEntryType::Character))
            .unwrap();

        let refs = service.detect_references("李四推开了门。").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].entry_id, "c1");
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (_dir, service) = test_service(MockTransport::ok());

        service
            .index_document("doc-a", &"字".repeat(500))
            .await
            .unwrap();
        assert!(service.delete_document("doc-a").unwrap() > 0);

        service
            .index_document("doc-b", &"字".repeat(500))
            .await
            .unwrap();
        service.clear_all().unwrap();
        let stats = service.stats().unwrap();
        assert_eq!(stats.index.chunk_count, 0);
    }

    #[tokio::test]
    async fn test_cache_maintenance_task_runs() {
        let (_dir, service) = test_service(MockTransport::ok());
        let service = Arc::new(service);

        let handle = service.spawn_cache_maintenance(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[test]
    fn test_search_mode_parsing() {
        assert_eq!("fast".parse::<SearchMode>().unwrap(), SearchMode::Fast);
        assert_eq!("FULL".parse::<SearchMode>().unwrap(), SearchMode::Full);
        assert!("quick".parse::<SearchMode>().is_err());
    }

    #[test]
    fn test_apply_ranking_reorders_and_keeps_leftovers() {
        let result = |i: usize| SearchResult {
            document_id: "d".into(),
            chunk_index: i,
            chunk_text: format!("第{}段", i),
            start_pos: 0,
            end_pos: 0,
            score: 0.5,
            rerank_score: None,
        };
        let ordered = apply_ranking(vec![result(0), result(1), result(2)], &[(2, 0.9), (0, 0.8)]);
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].chunk_index, 2);
        assert_eq!(ordered[0].rerank_score, Some(0.9));
        assert_eq!(ordered[1].chunk_index, 0);
        assert_eq!(ordered[2].chunk_index, 1);
        assert_eq!(ordered[2].rerank_score, None);
    }
}
