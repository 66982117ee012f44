//! Error types shared across the RAG pipeline.
//!
//! Components return `RagError` at their seams; the service layer maps
//! failures to safe defaults (empty results, `false`, `None`) so callers
//! above it never have to unwind. The CLI wraps everything in `anyhow`.

use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type RagResult<T> = Result<T, RagError>;

/// Failure taxonomy for the retrieval pipeline.
#[derive(Debug, Error)]
pub enum RagError {
    /// Connection-level failure (DNS, refused, reset). Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 429. Retryable after the server-provided delay.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Non-success HTTP status. 5xx is retryable, other 4xx is not.
    #[error("api error ({status}): {message}")]
    Client { status: u16, message: String },

    /// SQLite or serialization failure touching persisted state.
    #[error("storage error: {0}")]
    Storage(String),

    /// Rejected input or configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// A wall-clock budget ran out.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl RagError {
    /// Whether a retry with backoff could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::Network(_) | RagError::Timeout(_) => true,
            RagError::RateLimited { .. } => true,
            RagError::Client { status, .. } => *status >= 500,
            RagError::Storage(_) | RagError::Validation(_) => false,
        }
    }
}

impl From<rusqlite::Error> for RagError {
    fn from(e: rusqlite::Error) -> Self {
        RagError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Storage(format!("serialization failed: {}", e))
    }
}

impl From<reqwest::Error> for RagError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RagError::Timeout(Duration::from_secs(0))
        } else {
            RagError::Network(e.to_string())
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
