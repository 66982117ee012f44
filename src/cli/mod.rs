//! Command-line interface.
//!
//! Thin layer over [`RagService`]: every subcommand builds the service
//! from environment configuration, runs one operation and prints a
//! human-readable report.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::codex::{Codex, CodexEntry};
use crate::config::{get_data_dir, RagConfig};
use crate::service::{RagService, SearchMode};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "inkwell-rag")]
#[command(version, about = "Local RAG pipeline for fiction writing projects", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Index a text file into the vector store
    Index {
        /// File to index
        file: PathBuf,

        /// Document id (defaults to the file stem)
        #[arg(long)]
        id: Option<String>,

        /// Re-index even when the content hash is unchanged
        #[arg(long)]
        force: bool,
    },

    /// Search the indexed documents
    Search {
        /// Search query
        query: String,

        /// Retrieval mode: fast, balanced or full
        #[arg(short, long, default_value = "balanced")]
        mode: String,

        /// Maximum results to display
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Keyword search only, no embedding or rerank calls
        #[arg(long)]
        text_only: bool,
    },

    /// Detect codex entry references in a text file
    Detect {
        /// File to scan
        file: PathBuf,

        /// Codex JSON file (array of entries)
        #[arg(short, long)]
        codex: PathBuf,
    },

    /// Remove a document from the index
    Delete {
        /// Document id
        id: String,
    },

    /// Show index, cache and configuration status
    Status,

    /// Wipe the index and the cache
    Clear {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

/// Bearer token presence; indexing and semantic search need one.
fn has_api_key() -> bool {
    std::env::var("INKWELL_API_KEY")
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false)
}

fn build_service() -> Result<Arc<RagService>> {
    let config = RagConfig::from_env();
    let service = RagService::new(config).context("failed to initialize RAG service")?;
    Ok(Arc::new(service))
}

// ============================================================================
// CLI Runner
// ============================================================================

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Index { file, id, force } => cmd_index(&file, id, force).await,
        Commands::Search {
            query,
            mode,
            limit,
            text_only,
        } => cmd_search(&query, &mode, limit, text_only).await,
        Commands::Detect { file, codex } => cmd_detect(&file, &codex).await,
        Commands::Delete { id } => cmd_delete(&id).await,
        Commands::Status => cmd_status().await,
        Commands::Clear { yes } => cmd_clear(yes).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_index(file: &PathBuf, id: Option<String>, force: bool) -> Result<()> {
    if !has_api_key() {
        bail!(
            "No API key configured.\n\n\
             Set one with:\n  \
             export INKWELL_API_KEY=your-api-key\n\
             Optionally override the endpoint:\n  \
             export INKWELL_API_BASE=https://api.siliconflow.cn/v1"
        );
    }

    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {:?}", file))?;

    let document_id = id.unwrap_or_else(|| {
        file.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string()
    });

    println!("[*] Indexing {:?} as \"{}\"...", file, document_id);

    let service = build_service()?;
    let indexed = if force {
        service.index_document(&document_id, &text).await?
    } else {
        service.index_document_if_changed(&document_id, &text).await?
    };

    if indexed {
        let stats = service.stats()?;
        println!(
            "[OK] Indexed. {} documents, {} chunks total.",
            stats.index.document_count, stats.index.chunk_count
        );
    } else if force {
        println!("[!] Indexing failed: embeddings unavailable.");
    } else {
        println!("[OK] Nothing indexed (unchanged, or embeddings unavailable).");
    }

    Ok(())
}

async fn cmd_search(query: &str, mode: &str, limit: usize, text_only: bool) -> Result<()> {
    let mode: SearchMode = mode.parse()?;
    let service = build_service()?;

    println!("[*] Searching ({}) for \"{}\"", mode.as_str(), query);

    let results = if text_only || !has_api_key() {
        service.text_search(query, limit)?
    } else {
        service.search(query, mode).await?
    };

    if results.is_empty() {
        println!("\n[!] No results.");
        return Ok(());
    }

    println!("\n[OK] {} result(s):\n", results.len().min(limit));

    for (i, result) in results.iter().take(limit).enumerate() {
        println!(
            "{}. [score: {:.4}] {} (chunk {})",
            i + 1,
            result.ranking_score(),
            result.document_id,
            result.chunk_index
        );
        println!("   {}", truncate_text(&result.chunk_text, 200));
        println!();
    }

    Ok(())
}

async fn cmd_detect(file: &PathBuf, codex_path: &PathBuf) -> Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {:?}", file))?;
    let codex_json = tokio::fs::read_to_string(codex_path)
        .await
        .with_context(|| format!("failed to read {:?}", codex_path))?;

    let entries: Vec<CodexEntry> =
        serde_json::from_str(&codex_json).context("invalid codex JSON (expected an array)")?;
    println!("[*] Loaded {} codex entries.", entries.len());

    let service = build_service()?;
    service.set_codex(Codex::from_entries(entries))?;

    let references = service.detect_references(&text)?;

    if references.is_empty() {
        println!("[!] No references detected.");
        return Ok(());
    }

    println!("[OK] {} reference(s):\n", references.len());
    for reference in &references {
        println!(
            "  {:>5}..{:<5} [{}] {} ({:.2})",
            reference.start_pos,
            reference.end_pos,
            reference.entry_type.as_str(),
            reference.matched_text,
            reference.confidence
        );
        println!(
            "        ...{}[{}]{}...",
            reference.context_before, reference.matched_text, reference.context_after
        );
    }

    Ok(())
}

async fn cmd_delete(id: &str) -> Result<()> {
    let service = build_service()?;
    let removed = service.delete_document(id)?;

    if removed > 0 {
        println!("[OK] Removed \"{}\" ({} chunks).", id, removed);
    } else {
        println!("[!] No document with id \"{}\".", id);
    }

    Ok(())
}

async fn cmd_status() -> Result<()> {
    println!("inkwell-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let data_dir = get_data_dir();
    println!("[*] Data directory: {}", data_dir.display());

    if has_api_key() {
        println!("[OK] API key: configured");
    } else {
        println!("[!] API key: not set");
        println!("    Set it with: export INKWELL_API_KEY=your-key");
    }

    match build_service() {
        Ok(service) => {
            let stats = service.stats()?;
            println!(
                "[OK] Index: {} documents, {} chunks, {}",
                stats.index.document_count,
                stats.index.chunk_count,
                format_bytes(stats.index.total_text_bytes)
            );
            println!(
                "[OK] Cache: {} entries in memory ({}), hit rate {:.0}%",
                stats.cache.memory_entries,
                format_bytes(stats.cache.memory_bytes),
                stats.cache.hit_rate() * 100.0
            );
            if let Some(updated) = stats.index.last_updated {
                println!("[*] Last indexed: {}", updated.format("%Y-%m-%d %H:%M UTC"));
            }
            println!("[*] Searches logged: {}", stats.index.search_count);
        }
        Err(e) => {
            println!("[!] Service unavailable: {}", e);
        }
    }

    Ok(())
}

async fn cmd_clear(yes: bool) -> Result<()> {
    if !yes {
        bail!("This wipes the whole index and cache. Re-run with --yes to confirm.");
    }

    let service = build_service()?;
    service.clear_all()?;
    println!("[OK] Index and cache cleared.");

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Character-safe truncation for display.
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_truncate_cjk() {
        assert_eq!(truncate_text("青云城的客栈", 3), "青云城...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
