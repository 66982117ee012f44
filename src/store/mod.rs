//! Vector store backed by SQLite.
//!
//! Persists chunk embeddings under ~/.inkwell-rag/vectors.db, one row per
//! chunk, unique on (document_id, chunk_index). Similarity search is a
//! brute-force cosine scan over pages of rows with a hard wall-clock
//! budget; at the scale of a single writing project this beats maintaining
//! an ANN index.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use crate::chunker::TextChunk;
use crate::config::get_data_dir;
use crate::error::{RagError, RagResult};

// ============================================================================
// Constants
// ============================================================================

/// Wall-clock budget for a full similarity scan.
const SCAN_BUDGET: Duration = Duration::from_millis(800);

/// Rows fetched per page during a scan.
const SCAN_PAGE_SIZE: usize = 256;

// ============================================================================
// Types
// ============================================================================

/// A stored chunk embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub document_id: String,
    pub chunk_index: usize,
    pub chunk_text: String,
    pub start_pos: usize,
    pub end_pos: usize,
    pub vector: Vec<f32>,
    /// Model that produced `vector`.
    pub model_id: String,
    /// Carries the document content hash under `"content_hash"`.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One search hit, semantic or text-based.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub document_id: String,
    pub chunk_index: usize,
    pub chunk_text: String,
    pub start_pos: usize,
    pub end_pos: usize,
    /// Cosine similarity (semantic) or keyword score (text search).
    pub score: f32,
    /// Present once a reranker has re-ordered the results.
    pub rerank_score: Option<f32>,
}

impl SearchResult {
    /// Score used for final ordering: rerank wins over retrieval.
    pub fn ranking_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }
}

/// Per-document view derived from the chunk rows.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub document_id: String,
    pub chunk_count: usize,
    pub indexed_at: DateTime<Utc>,
}

/// Store-wide statistics, derived on demand.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub document_ids: Vec<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub total_text_bytes: usize,
    pub search_count: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// VectorStore
// ============================================================================

/// SQLite-backed embedding store with cosine scan and text fallback search.
pub struct VectorStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl VectorStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> RagResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    RagError::Storage(format!("failed to create database directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// Open at the default location (~/.inkwell-rag/vectors.db).
    pub fn open_default() -> RagResult<Self> {
        let data_dir = get_data_dir();
        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir).map_err(|e| {
                RagError::Storage(format!("failed to create data directory: {}", e))
            })?;
        }
        Self::open(&data_dir.join("vectors.db"))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> RagResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RagError::Storage(format!("lock error: {}", e)))
    }

    fn initialize(&self) -> RagResult<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS document_embeddings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_text TEXT NOT NULL,
                start_pos INTEGER NOT NULL,
                end_pos INTEGER NOT NULL,
                embedding TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(document_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_embeddings_document
                ON document_embeddings(document_id);
            CREATE INDEX IF NOT EXISTS idx_embeddings_created
                ON document_embeddings(created_at);

            CREATE TABLE IF NOT EXISTS search_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query TEXT NOT NULL,
                mode TEXT NOT NULL,
                result_count INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;

        tracing::debug!("vector store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Indexing
    // ------------------------------------------------------------------

    /// Replace every chunk of `document_id` in one transaction. Either the
    /// whole document lands or nothing does. The content hash travels in
    /// each row's metadata.
    pub fn replace_document(
        &self,
        document_id: &str,
        content_hash: &str,
        model_id: &str,
        chunks: &[(TextChunk, Vec<f32>)],
    ) -> RagResult<usize> {
        let mut conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let metadata = serde_json::json!({ "content_hash": content_hash }).to_string();

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM document_embeddings WHERE document_id = ?1",
            params![document_id],
        )?;
        for (chunk, vector) in chunks {
            let vector_json = serde_json::to_string(vector)?;
            tx.execute(
                "INSERT INTO document_embeddings
                    (document_id, chunk_index, chunk_text, start_pos, end_pos,
                     embedding, embedding_model, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    document_id,
                    chunk.chunk_index as i64,
                    chunk.text,
                    chunk.start_pos as i64,
                    chunk.end_pos as i64,
                    vector_json,
                    model_id,
                    metadata,
                    now
                ],
            )?;
        }
        tx.commit()?;

        tracing::info!("indexed document {} ({} chunks)", document_id, chunks.len());
        Ok(chunks.len())
    }

    pub fn document_exists(&self, document_id: &str) -> RagResult<bool> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM document_embeddings WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Content hash recorded at index time, from the first chunk's metadata.
    pub fn get_document_hash(&self, document_id: &str) -> RagResult<Option<String>> {
        let conn = self.lock()?;
        let metadata: Option<String> = conn
            .query_row(
                "SELECT metadata FROM document_embeddings
                 WHERE document_id = ?1 ORDER BY chunk_index LIMIT 1",
                params![document_id],
                |row| row.get(0),
            )
            .ok();
        let Some(metadata) = metadata else {
            return Ok(None);
        };
        let value: serde_json::Value = serde_json::from_str(&metadata)?;
        Ok(value
            .get("content_hash")
            .and_then(|h| h.as_str())
            .map(|h| h.to_string()))
    }

    /// True when `document_id` is new or its stored content hash differs.
    pub fn has_document_changed(&self, document_id: &str, content_hash: &str) -> RagResult<bool> {
        Ok(self.get_document_hash(document_id)?.as_deref() != Some(content_hash))
    }

    /// Remove a document's chunks. Returns removed chunk count.
    pub fn delete_document(&self, document_id: &str) -> RagResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM document_embeddings WHERE document_id = ?1",
            params![document_id],
        )?;
        Ok(removed)
    }

    /// All chunks of a document, ordered by chunk index.
    pub fn get_document_chunks(&self, document_id: &str) -> RagResult<Vec<EmbeddingRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM document_embeddings WHERE document_id = ?1 ORDER BY chunk_index",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![document_id], row_to_record)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Indexed documents, most recently updated first.
    pub fn list_documents(&self) -> RagResult<Vec<DocumentInfo>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT document_id, COUNT(*), MAX(updated_at)
             FROM document_embeddings GROUP BY document_id ORDER BY MAX(updated_at) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DocumentInfo {
                document_id: row.get(0)?,
                chunk_count: row.get::<_, i64>(1)? as usize,
                indexed_at: parse_datetime(row.get::<_, String>(2)?),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Brute-force cosine scan. Results with raw cosine below `min_score`
    /// are dropped; the reported score adds small position/length bonuses
    /// and is clamped to 1.0. The scan stops once [`SCAN_BUDGET`] elapses
    /// and returns what it has.
    pub fn similarity_search(
        &self,
        query_vector: &[f32],
        limit: usize,
        min_score: f32,
    ) -> RagResult<Vec<SearchResult>> {
        if query_vector.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let started = Instant::now();
        let mut hits: Vec<SearchResult> = Vec::new();
        let mut offset = 0usize;

        loop {
            let page = self.fetch_page(offset, SCAN_PAGE_SIZE)?;
            if page.is_empty() {
                break;
            }
            offset += page.len();

            for record in page {
                let cos = cosine_similarity(query_vector, &record.vector);
                if cos < min_score {
                    continue;
                }
                let score = (cos + position_bonus(record.chunk_index)
                    + length_bonus(record.chunk_text.chars().count()))
                .min(1.0);
                hits.push(SearchResult {
                    document_id: record.document_id,
                    chunk_index: record.chunk_index,
                    chunk_text: record.chunk_text,
                    start_pos: record.start_pos,
                    end_pos: record.end_pos,
                    score,
                    rerank_score: None,
                });
            }

            if started.elapsed() > SCAN_BUDGET {
                tracing::warn!("similarity scan hit time budget after {} rows", offset);
                break;
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    fn fetch_page(&self, offset: usize, page_size: usize) -> RagResult<Vec<EmbeddingRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM document_embeddings ORDER BY id LIMIT ?1 OFFSET ?2",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![page_size as i64, offset as i64], row_to_record)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Keyword LIKE search used when embeddings are unavailable. Scores by
    /// keyword hit count, a length band and an early-chunk bonus; snippets
    /// are capped at 200 characters.
    pub fn fast_text_search(
        &self,
        keywords: &[String],
        limit: usize,
    ) -> RagResult<Vec<SearchResult>> {
        if keywords.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM document_embeddings WHERE chunk_text LIKE ?1 LIMIT 200",
            RECORD_COLUMNS
        ))?;

        // Gather candidates per keyword, deduplicated by row id.
        let mut candidates: Vec<EmbeddingRecord> = Vec::new();
        let mut seen: std::collections::HashSet<i64> = std::collections::HashSet::new();
        for keyword in keywords {
            let pattern = format!("%{}%", keyword);
            let rows = stmt.query_map(params![pattern], row_to_record)?;
            for record in rows.filter_map(|r| r.ok()) {
                if seen.insert(record.id) {
                    candidates.push(record);
                }
            }
        }
        drop(stmt);
        drop(conn);

        let mut hits: Vec<SearchResult> = candidates
            .into_iter()
            .map(|record| {
                let score = text_score(&record.chunk_text, record.chunk_index, keywords);
                let snippet: String = record.chunk_text.chars().take(200).collect();
                SearchResult {
                    document_id: record.document_id,
                    chunk_index: record.chunk_index,
                    chunk_text: snippet,
                    start_pos: record.start_pos,
                    end_pos: record.end_pos,
                    score,
                    rerank_score: None,
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Record one search for the stats view.
    pub fn log_search(
        &self,
        query: &str,
        mode: &str,
        result_count: usize,
        duration: Duration,
    ) -> RagResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO search_history (query, mode, result_count, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                query,
                mode,
                result_count as i64,
                duration.as_millis() as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> RagResult<IndexStats> {
        let document_ids: Vec<String> = self
            .list_documents()?
            .into_iter()
            .map(|d| d.document_id)
            .collect();

        let conn = self.lock()?;
        let chunk_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM document_embeddings", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);
        let total_text_bytes: i64 = conn
            .query_row(
                // LENGTH on TEXT counts characters; cast to BLOB for bytes.
                "SELECT COALESCE(SUM(LENGTH(CAST(chunk_text AS BLOB))), 0) FROM document_embeddings",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        let last_updated: Option<String> = conn
            .query_row(
                "SELECT MAX(updated_at) FROM document_embeddings",
                [],
                |row| row.get(0),
            )
            .unwrap_or(None);
        let search_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM search_history", [], |row| row.get(0))
            .unwrap_or(0);

        Ok(IndexStats {
            document_count: document_ids.len(),
            chunk_count: chunk_count as usize,
            document_ids,
            last_updated: last_updated.map(parse_datetime),
            total_text_bytes: total_text_bytes as usize,
            search_count: search_count as usize,
            db_path: self.db_path.clone(),
        })
    }

    /// Reclaim space and refresh the query planner statistics.
    pub fn optimize(&self) -> RagResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("VACUUM; ANALYZE;")?;
        Ok(())
    }

    /// Drop everything.
    pub fn clear(&self) -> RagResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM document_embeddings; DELETE FROM search_history;")?;
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

const RECORD_COLUMNS: &str = "id, document_id, chunk_index, chunk_text, start_pos, end_pos, \
                              embedding, embedding_model, metadata, created_at, updated_at";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingRecord> {
    let vector_json: String = row.get(6)?;
    let vector: Vec<f32> = serde_json::from_str(&vector_json).unwrap_or_default();
    let metadata_json: String = row.get(8)?;
    let metadata: serde_json::Value =
        serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);
    Ok(EmbeddingRecord {
        id: row.get(0)?,
        document_id: row.get(1)?,
        chunk_index: row.get::<_, i64>(2)? as usize,
        chunk_text: row.get(3)?,
        start_pos: row.get::<_, i64>(4)? as usize,
        end_pos: row.get::<_, i64>(5)? as usize,
        vector,
        model_id: row.get(7)?,
        metadata,
        created_at: parse_datetime(row.get::<_, String>(9)?),
        updated_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Opening chunks carry slightly more setup context.
fn position_bonus(chunk_index: usize) -> f32 {
    match chunk_index {
        0 => 0.01,
        1 => 0.005,
        _ => 0.0,
    }
}

/// Mid-length chunks tend to be complete thoughts.
fn length_bonus(char_count: usize) -> f32 {
    if (100..=800).contains(&char_count) {
        0.01
    } else if (50..1200).contains(&char_count) {
        0.005
    } else {
        0.0
    }
}

fn text_score(chunk_text: &str, chunk_index: usize, keywords: &[String]) -> f32 {
    let hits = keywords
        .iter()
        .filter(|k| chunk_text.contains(k.as_str()))
        .count();
    let mut score = hits as f32;
    let chars = chunk_text.chars().count();
    if (50..=600).contains(&chars) {
        score += 0.3;
    }
    // Early-chunk bonus, scaled up from the similarity tie-break.
    score += position_bonus(chunk_index) * 20.0;
    score
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MODEL: &str = "test-embedding-model";

    fn create_test_store() -> (TempDir, VectorStore) {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(&dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    fn chunk(text: &str, index: usize) -> TextChunk {
        TextChunk {
            text: text.to_string(),
            chunk_index: index,
            document_id: "doc1".to_string(),
            start_pos: index * 100,
            end_pos: index * 100 + text.chars().count(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_replace_and_read_back_in_order() {
        let (_dir, store) = create_test_store();

        let chunks = vec![
            (chunk("第一段", 0), vec![1.0, 0.0]),
            (chunk("第二段", 1), vec![0.0, 1.0]),
        ];
        let count = store
            .replace_document("doc1", "hash-a", MODEL, &chunks)
            .unwrap();
        assert_eq!(count, 2);

        let records = store.get_document_chunks("doc1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].chunk_index, 0);
        assert_eq!(records[0].chunk_text, "第一段");
        assert_eq!(records[0].model_id, MODEL);
        assert_eq!(records[1].chunk_index, 1);
        assert_eq!(records[1].vector, vec![0.0, 1.0]);
    }

    #[test]
    fn test_replace_overwrites_previous_chunks() {
        let (_dir, store) = create_test_store();

        let old = vec![
            (chunk("旧一", 0), vec![1.0, 0.0]),
            (chunk("旧二", 1), vec![0.0, 1.0]),
            (chunk("旧三", 2), vec![0.5, 0.5]),
        ];
        store.replace_document("doc1", "hash-a", MODEL, &old).unwrap();

        let new = vec![(chunk("新一", 0), vec![1.0, 1.0])];
        store.replace_document("doc1", "hash-b", MODEL, &new).unwrap();

        let records = store.get_document_chunks("doc1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].chunk_text, "新一");
    }

    #[test]
    fn test_document_exists_and_hash() {
        let (_dir, store) = create_test_store();

        assert!(!store.document_exists("doc1").unwrap());
        assert_eq!(store.get_document_hash("doc1").unwrap(), None);

        store
            .replace_document("doc1", "hash-a", MODEL, &[(chunk("内容", 0), vec![1.0])])
            .unwrap();
        assert!(store.document_exists("doc1").unwrap());
        assert_eq!(
            store.get_document_hash("doc1").unwrap(),
            Some("hash-a".to_string())
        );
    }

    #[test]
    fn test_has_document_changed() {
        let (_dir, store) = create_test_store();

        // Unknown document counts as changed.
        assert!(store.has_document_changed("doc1", "hash-a").unwrap());

        store
            .replace_document("doc1", "hash-a", MODEL, &[(chunk("内容", 0), vec![1.0])])
            .unwrap();
        assert!(!store.has_document_changed("doc1", "hash-a").unwrap());
        assert!(store.has_document_changed("doc1", "hash-b").unwrap());
    }

    #[test]
    fn test_delete_document_returns_chunk_count() {
        let (_dir, store) = create_test_store();

        let chunks = vec![(chunk("一", 0), vec![1.0]), (chunk("二", 1), vec![2.0])];
        store.replace_document("doc1", "h", MODEL, &chunks).unwrap();

        assert_eq!(store.delete_document("doc1").unwrap(), 2);
        assert_eq!(store.delete_document("doc1").unwrap(), 0);
        assert!(store.get_document_chunks("doc1").unwrap().is_empty());
        assert_eq!(store.stats().unwrap().document_count, 0);
    }

    #[test]
    fn test_similarity_search_identical_vector_ranks_first() {
        let (_dir, store) = create_test_store();

        let chunks = vec![
            (chunk("完全匹配的段落", 0), vec![0.6, 0.8, 0.0]),
            (chunk("无关的段落", 1), vec![0.0, 0.0, 1.0]),
            (chunk("部分相关的段落", 2), vec![0.8, 0.6, 0.0]),
        ];
        store.replace_document("doc1", "h", MODEL, &chunks).unwrap();

        let results = store.similarity_search(&[0.6, 0.8, 0.0], 3, 0.1).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].chunk_index, 0);
        assert!(results[0].score >= 0.99);
        assert!(results[0].score <= 1.0);
    }

    #[test]
    fn test_similarity_search_respects_min_score_and_limit() {
        let (_dir, store) = create_test_store();

        let chunks = vec![
            (chunk("甲", 0), vec![1.0, 0.0]),
            (chunk("乙", 1), vec![0.9, 0.1]),
            (chunk("丙", 2), vec![0.0, 1.0]),
        ];
        store.replace_document("doc1", "h", MODEL, &chunks).unwrap();

        // Orthogonal chunk filtered out by min_score.
        let results = store.similarity_search(&[1.0, 0.0], 10, 0.5).unwrap();
        assert_eq!(results.len(), 2);

        let results = store.similarity_search(&[1.0, 0.0], 1, 0.5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_index, 0);
    }

    #[test]
    fn test_fast_text_search() {
        let (_dir, store) = create_test_store();

        let chunks = vec![
            (chunk("李四走进了青云城的大门", 0), vec![1.0]),
            (chunk("天色渐渐暗了下来", 1), vec![1.0]),
            (chunk("李四在青云城遇见了故人", 2), vec![1.0]),
        ];
        store.replace_document("doc1", "h", MODEL, &chunks).unwrap();

        let keywords = vec!["李四".to_string(), "青云城".to_string()];
        let results = store.fast_text_search(&keywords, 10).unwrap();
        assert_eq!(results.len(), 2);
        // Both hits contain both keywords; the earlier chunk wins.
        assert_eq!(results[0].chunk_index, 0);
    }

    #[test]
    fn test_fast_text_snippet_capped() {
        let (_dir, store) = create_test_store();

        let long_text = format!("关键词{}", "字".repeat(400));
        store
            .replace_document("doc1", "h", MODEL, &[(chunk(&long_text, 0), vec![1.0])])
            .unwrap();

        let results = store.fast_text_search(&["关键词".to_string()], 1).unwrap();
        assert_eq!(results[0].chunk_text.chars().count(), 200);
    }

    #[test]
    fn test_stats_and_clear() {
        let (_dir, store) = create_test_store();

        // 3 CJK chars (3 bytes each) plus 2 ASCII digits: 11 bytes.
        store
            .replace_document("doc1", "h", MODEL, &[(chunk("青云城12", 0), vec![1.0])])
            .unwrap();
        store
            .log_search("查询", "balanced", 1, Duration::from_millis(5))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.document_ids, vec!["doc1".to_string()]);
        assert!(stats.last_updated.is_some());
        assert_eq!(stats.total_text_bytes, 11);
        assert_eq!(stats.search_count, 1);

        store.clear().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.document_count, 0);
        assert_eq!(stats.chunk_count, 0);
        assert!(stats.last_updated.is_none());
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        let cos = cosine_similarity(&[0.6, 0.8], &[0.6, 0.8]);
        assert!((cos - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_list_documents() {
        let (_dir, store) = create_test_store();

        store
            .replace_document("doc1", "h1", MODEL, &[(chunk("一", 0), vec![1.0])])
            .unwrap();
        store
            .replace_document("doc2", "h2", MODEL, &[(chunk("二", 0), vec![1.0])])
            .unwrap();

        let docs = store.list_documents().unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs
            .iter()
            .any(|d| d.document_id == "doc1" && d.chunk_count == 1));
    }
}
