//! Pipeline configuration.
//!
//! Everything tunable lives in one explicit `RagConfig` struct built from
//! defaults, a JSON file, or environment variables. Components receive the
//! sub-struct they care about at construction time.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::chunker::ChunkConfig;
use crate::detector::DetectionConfig;
use crate::error::{RagError, RagResult};

// ============================================================================
// Data Directory
// ============================================================================

/// Default data directory (~/.inkwell-rag/).
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".inkwell-rag")
}

// ============================================================================
// API / Network
// ============================================================================

/// Remote API endpoint settings shared by embedding and rerank calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL, without trailing slash (e.g. "https://api.siliconflow.cn/v1").
    pub base_url: String,
    /// Bearer token.
    pub api_key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.siliconflow.cn/v1".to_string(),
            api_key: String::new(),
        }
    }
}

impl ApiConfig {
    /// Read endpoint settings from the environment.
    ///
    /// `INKWELL_API_BASE` overrides the base URL, `INKWELL_API_KEY` supplies
    /// the bearer token.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = std::env::var("INKWELL_API_BASE") {
            if !base.is_empty() {
                config.base_url = base.trim_end_matches('/').to_string();
            }
        }
        if let Ok(key) = std::env::var("INKWELL_API_KEY") {
            config.api_key = key;
        }
        config
    }
}

/// Retry and degraded-mode policy for remote calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Maximum retry attempts after the initial request.
    pub max_retries: u32,
    /// When the network is marked unhealthy, skip requests and return
    /// fallback values instead of waiting on timeouts.
    pub enable_fallback: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            enable_fallback: true,
        }
    }
}

// ============================================================================
// Model Settings
// ============================================================================

/// Embedding model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model identifier sent to the embeddings endpoint.
    pub model: String,
    /// Cache TTL for embedding vectors, in seconds.
    pub cache_ttl_secs: u64,
    /// Hard wall-clock budget for a single embed call, in seconds.
    pub single_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "BAAI/bge-large-zh-v1.5".to_string(),
            cache_ttl_secs: 7200,
            single_timeout_secs: 10,
        }
    }
}

/// Rerank model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Model identifier sent to the rerank endpoint.
    pub model: String,
    /// Disabled reranking always yields the identity ordering.
    pub enabled: bool,
    /// Cache TTL for rerank results, in seconds.
    pub cache_ttl_secs: u64,
    /// Hard wall-clock budget for a rerank call, in seconds.
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            model: "BAAI/bge-reranker-v2-m3".to_string(),
            enabled: true,
            cache_ttl_secs: 3600,
            timeout_secs: 10,
        }
    }
}

// ============================================================================
// Search Modes
// ============================================================================

/// Retrieval tuning for one search mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModeParams {
    /// Maximum results returned.
    pub limit: usize,
    /// Minimum cosine similarity kept by the scan.
    pub min_similarity: f32,
    /// Character budget for assembled prompt context.
    pub char_budget: usize,
}

/// Per-mode retrieval presets. Each row is independently tunable; the
/// defaults trade recall against latency and context size.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchModes {
    pub fast: ModeParams,
    pub balanced: ModeParams,
    pub full: ModeParams,
}

impl Default for SearchModes {
    fn default() -> Self {
        Self {
            fast: ModeParams {
                limit: 15,
                min_similarity: 0.40,
                char_budget: 400,
            },
            balanced: ModeParams {
                limit: 35,
                min_similarity: 0.30,
                char_budget: 800,
            },
            full: ModeParams {
                limit: 50,
                min_similarity: 0.25,
                char_budget: 1500,
            },
        }
    }
}

impl SearchModes {
    fn rows(&self) -> [(&'static str, &ModeParams); 3] {
        [
            ("fast", &self.fast),
            ("balanced", &self.balanced),
            ("full", &self.full),
        ]
    }
}

// ============================================================================
// RagConfig
// ============================================================================

/// Top-level configuration for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub api: ApiConfig,
    pub network: NetworkConfig,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub chunking: ChunkConfig,
    pub cache: CacheConfig,
    pub detection: DetectionConfig,
    pub modes: SearchModes,
    /// Concurrent network-bound operations (semaphore permits).
    pub worker_count: usize,
    /// Data directory; `None` uses `get_data_dir()`.
    pub data_dir: Option<PathBuf>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            network: NetworkConfig::default(),
            embedding: EmbeddingConfig::default(),
            rerank: RerankConfig::default(),
            chunking: ChunkConfig::default(),
            cache: CacheConfig::default(),
            detection: DetectionConfig::default(),
            modes: SearchModes::default(),
            worker_count: 4,
            data_dir: None,
        }
    }
}

impl RagConfig {
    /// Defaults plus API settings from the environment.
    pub fn from_env() -> Self {
        Self {
            api: ApiConfig::from_env(),
            ..Self::default()
        }
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(get_data_dir)
    }

    /// Reject configurations that would misbehave at runtime.
    pub fn validate(&self) -> RagResult<()> {
        if self.chunking.chunk_size == 0 {
            return Err(RagError::Validation("chunk_size must be > 0".into()));
        }
        if self.chunking.overlap * 2 >= self.chunking.chunk_size {
            return Err(RagError::Validation(format!(
                "overlap {} too large for chunk_size {} (must stay under half)",
                self.chunking.overlap, self.chunking.chunk_size
            )));
        }
        if self.worker_count == 0 {
            return Err(RagError::Validation("worker_count must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return Err(RagError::Validation(format!(
                "min_confidence {} outside [0, 1]",
                self.detection.min_confidence
            )));
        }
        if self.embedding.model.is_empty() {
            return Err(RagError::Validation("embedding model is empty".into()));
        }
        for (name, params) in self.modes.rows() {
            if params.limit == 0 {
                return Err(RagError::Validation(format!(
                    "mode '{}' has a zero result limit",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&params.min_similarity) {
                return Err(RagError::Validation(format!(
                    "mode '{}' min_similarity {} outside [0, 1]",
                    name, params.min_similarity
                )));
            }
            if params.char_budget == 0 {
                return Err(RagError::Validation(format!(
                    "mode '{}' has a zero character budget",
                    name
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.chunking.chunk_size, 250);
        assert_eq!(config.chunking.overlap, 50);
    }

    #[test]
    fn test_rejects_oversized_overlap() {
        let mut config = RagConfig::default();
        config.chunking.chunk_size = 100;
        config.chunking.overlap = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = RagConfig::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_confidence() {
        let mut config = RagConfig::default();
        config.detection.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_mode_params() {
        let mut config = RagConfig::default();
        config.modes.fast.limit = 0;
        assert!(config.validate().is_err());

        let mut config = RagConfig::default();
        config.modes.full.min_similarity = -0.1;
        assert!(config.validate().is_err());

        let mut config = RagConfig::default();
        config.modes.balanced.char_budget = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_dir_override() {
        let mut config = RagConfig::default();
        config.data_dir = Some(PathBuf::from("/tmp/rag-test"));
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/rag-test"));
    }
}
