//! Text chunking.
//!
//! Splits long documents into overlapping chunks that end on natural
//! boundaries (sentence end, paragraph break, clause break) so each chunk
//! embeds as a coherent unit. All positions are character offsets, not
//! bytes, since the target texts are mostly CJK.

use serde::{Deserialize, Serialize};

// ============================================================================
// Chunk Configuration
// ============================================================================

/// Chunking settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Target chunk size in characters.
    pub chunk_size: usize,
    /// Characters of overlap carried into the next chunk.
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 250,
            overlap: 50,
        }
    }
}

impl ChunkConfig {
    /// Larger chunks for coarse indexing of long-form prose.
    pub fn for_long_form() -> Self {
        Self {
            chunk_size: 400,
            overlap: 80,
        }
    }

    /// No overlap, for fast one-off indexing.
    pub fn for_fast() -> Self {
        Self {
            chunk_size: 250,
            overlap: 0,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// A contiguous span of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
    pub document_id: String,
    /// Start offset in characters (inclusive).
    pub start_pos: usize,
    /// End offset in characters (exclusive).
    pub end_pos: usize,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// Chunking strategy.
pub trait Chunker: Send + Sync {
    /// Split `text` into chunks attributed to `document_id`.
    fn chunk(&self, text: &str, document_id: &str) -> Vec<TextChunk>;

    /// Strategy name.
    fn name(&self) -> &'static str;
}

// ============================================================================
// SentenceChunker
// ============================================================================

/// Boundary separators, strongest first. A window only shrinks to a
/// separator when at least half the target size survives.
const SEPARATORS: [&str; 7] = ["。", "！", "？", "\n\n", "\n", "，", " "];

/// Sentence-aware chunker.
///
/// Windows of `chunk_size` characters are pulled back to the last strong
/// boundary inside the window, then the next window restarts `overlap`
/// characters before the previous end.
pub struct SentenceChunker {
    config: ChunkConfig,
}

impl SentenceChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    /// Find a cut position in `(start, end)`: the end of the last occurrence
    /// of the strongest separator, provided it keeps the window above half
    /// the target size.
    fn find_cut(chars: &[char], start: usize, end: usize, chunk_size: usize) -> Option<usize> {
        let min_cut = start + chunk_size / 2;

        for sep in SEPARATORS {
            let sep_chars: Vec<char> = sep.chars().collect();
            let sep_len = sep_chars.len();
            if end - start < sep_len {
                continue;
            }

            // Scan backward for the last occurrence fully inside the window.
            let mut pos = end - sep_len;
            loop {
                if chars[pos..pos + sep_len] == sep_chars[..] {
                    if pos > min_cut {
                        return Some(pos + sep_len);
                    }
                    // Last occurrence is too early; a weaker separator may
                    // still land later in the window.
                    break;
                }
                if pos == start {
                    break;
                }
                pos -= 1;
            }
        }

        None
    }
}

impl Chunker for SentenceChunker {
    fn chunk(&self, text: &str, document_id: &str) -> Vec<TextChunk> {
        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        if total == 0 {
            return vec![];
        }

        let size = self.config.chunk_size.max(1);
        let overlap = self.config.overlap;

        if total <= size {
            return vec![TextChunk {
                text: text.to_string(),
                chunk_index: 0,
                document_id: document_id.to_string(),
                start_pos: 0,
                end_pos: total,
                metadata: serde_json::Value::Null,
            }];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut index = 0usize;

        while start < total {
            let mut end = (start + size).min(total);

            // Only pull back to a boundary when the window is not final.
            if end < total {
                if let Some(cut) = Self::find_cut(&chars, start, end, size) {
                    end = cut;
                }
            }

            chunks.push(TextChunk {
                text: chars[start..end].iter().collect(),
                chunk_index: index,
                document_id: document_id.to_string(),
                start_pos: start,
                end_pos: end,
                metadata: serde_json::Value::Null,
            });
            index += 1;

            if end >= total {
                break;
            }

            // Overlap into the next window, but always make progress.
            let next = end.saturating_sub(overlap);
            start = if next > start { next } else { end };
        }

        chunks
    }

    fn name(&self) -> &'static str {
        "SentenceChunker"
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// Default chunker for indexing.
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(SentenceChunker::with_defaults())
}

/// Sentence chunker with explicit settings.
pub fn sentence_chunker(config: ChunkConfig) -> Box<dyn Chunker> {
    Box::new(SentenceChunker::new(config))
}

// ============================================================================
// Tests
// ============================================================================
