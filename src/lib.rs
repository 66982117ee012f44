//! inkwell-rag - local RAG pipeline for fiction writing projects
//!
//! Chunks manuscript text, embeds it through an OpenAI-compatible API,
//! stores the vectors in SQLite and answers searches with cosine scan plus
//! rerank. A rule-based detector finds codex entry references (characters,
//! locations, objects) in Chinese prose.

pub mod cache;
pub mod chunker;
pub mod cli;
pub mod codex;
pub mod config;
pub mod detector;
pub mod embedding;
pub mod error;
pub mod rerank;
pub mod segment;
pub mod service;
pub mod store;

mod hash;

// Re-exports
pub use cache::{CacheConfig, CacheStats, SmartCache};
pub use chunker::{default_chunker, sentence_chunker, ChunkConfig, Chunker, TextChunk};
pub use codex::{Codex, CodexEntry, CodexEntryType};
pub use config::{
    get_data_dir, ApiConfig, EmbeddingConfig, ModeParams, NetworkConfig, RagConfig, RerankConfig,
    SearchModes,
};
pub use detector::{DetectedReference, DetectionConfig, DetectionStats, ReferenceDetector};
pub use embedding::{ApiTransport, EmbeddingClient, HttpTransport};
pub use error::{RagError, RagResult};
pub use rerank::Reranker;
pub use segment::KeywordExtractor;
pub use service::{RagService, SearchMode, ServiceStats};
pub use store::{
    cosine_similarity, DocumentInfo, EmbeddingRecord, IndexStats, SearchResult, VectorStore,
};
