//! Two-tier result cache.
//!
//! Memory tier: bounded LRU map keyed by string, values stored as JSON.
//! Disk tier: SQLite table that receives entries evicted from memory and
//! survives restarts. Reads check memory first; a disk hit is promoted
//! back into memory. Expired entries are treated as absent in both tiers.
//!
//! One mutex guards the whole cache. Critical sections are short; no
//! network call ever happens under the lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, RagResult};

// ============================================================================
// Cache Configuration
// ============================================================================

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum entries held in memory.
    pub max_memory_entries: usize,
    /// Byte budget for the memory tier (serialized size).
    pub max_memory_bytes: usize,
    /// TTL applied when `put` does not specify one, in seconds.
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_memory_entries: 500,
            max_memory_bytes: 50 * 1024 * 1024,
            default_ttl_secs: 3600,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Hit/miss counters, plus a snapshot of the memory tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
    pub memory_entries: usize,
    pub memory_bytes: usize,
}

impl CacheStats {
    /// Combined hit rate over both tiers.
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.memory_hits + self.disk_hits) as f64 / self.total_requests as f64
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    created_at: f64,
    last_accessed: f64,
    access_count: u64,
    ttl_secs: f64,
    size_bytes: usize,
    tags: Vec<String>,
}

impl MemoryEntry {
    fn is_expired(&self, now: f64) -> bool {
        now - self.created_at > self.ttl_secs
    }
}

struct CacheInner {
    entries: HashMap<String, MemoryEntry>,
    total_bytes: usize,
    disk: Option<Connection>,
    stats: CacheStats,
}

// ============================================================================
// SmartCache
// ============================================================================

/// Two-tier TTL cache with tag-based invalidation.
pub struct SmartCache {
    inner: Mutex<CacheInner>,
    enabled: bool,
    max_entries: usize,
    max_bytes: usize,
    default_ttl_secs: f64,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl SmartCache {
    /// Memory-only cache.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_bytes: 0,
                disk: None,
                stats: CacheStats::default(),
            }),
            enabled: config.enabled,
            max_entries: config.max_memory_entries.max(1),
            max_bytes: config.max_memory_bytes.max(1),
            default_ttl_secs: config.default_ttl_secs as f64,
        }
    }

    /// Cache with a persistent disk tier at `path`.
    pub fn with_disk(config: &CacheConfig, path: &Path) -> RagResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RagError::Storage(format!("cache dir: {}", e)))?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at REAL NOT NULL,
                last_accessed REAL NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                ttl REAL NOT NULL,
                size_bytes INTEGER NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )?;

        let cache = Self::new(config);
        if let Ok(mut inner) = cache.inner.lock() {
            inner.disk = Some(conn);
        }
        Ok(cache)
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Fetch and deserialize. Expired or unparsable entries count as misses.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        let now = now_secs();
        inner.stats.total_requests += 1;

        // Memory tier.
        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.is_expired(now) {
                let size = entry.size_bytes;
                inner.entries.remove(key);
                inner.total_bytes = inner.total_bytes.saturating_sub(size);
            } else {
                entry.last_accessed = now;
                entry.access_count += 1;
                let value = entry.value.clone();
                inner.stats.memory_hits += 1;
                return serde_json::from_str(&value).ok();
            }
        }

        // Disk tier: promote hits back into memory.
        if let Some(entry) = Self::disk_take(&mut inner, key, now) {
            let value = entry.value.clone();
            Self::insert_entry(&mut inner, self.max_entries, self.max_bytes, key, entry);
            inner.stats.disk_hits += 1;
            return serde_json::from_str(&value).ok();
        }

        inner.stats.misses += 1;
        None
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Store a value with optional TTL override and invalidation tags.
    pub fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: Option<u64>,
        tags: &[String],
    ) -> RagResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let serialized = serde_json::to_string(value)?;
        let now = now_secs();
        let entry = MemoryEntry {
            size_bytes: serialized.len(),
            value: serialized,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl_secs: ttl_secs.map(|t| t as f64).unwrap_or(self.default_ttl_secs),
            tags: tags.to_vec(),
        };

        let mut inner = self
            .inner
            .lock()
            .map_err(|e| RagError::Storage(format!("cache lock poisoned: {}", e)))?;
        Self::insert_entry(&mut inner, self.max_entries, self.max_bytes, key, entry);
        Ok(())
    }

    fn insert_entry(
        inner: &mut CacheInner,
        max_entries: usize,
        max_bytes: usize,
        key: &str,
        entry: MemoryEntry,
    ) {
        if let Some(old) = inner.entries.remove(key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.size_bytes);
        }

        // Values larger than the whole memory budget go straight to disk.
        if entry.size_bytes > max_bytes {
            Self::disk_put(inner, key, &entry);
            return;
        }

        Self::make_room(inner, max_entries, max_bytes, entry.size_bytes);
        inner.total_bytes += entry.size_bytes;
        inner.entries.insert(key.to_string(), entry);
    }

    /// Evict until one more entry of `incoming_bytes` fits. Expired entries
    /// go first; then LRU, with unexpired evictees demoted to disk.
    fn make_room(
        inner: &mut CacheInner,
        max_entries: usize,
        max_bytes: usize,
        incoming_bytes: usize,
    ) {
        let now = now_secs();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
            }
        }

        while inner.entries.len() + 1 > max_entries
            || inner.total_bytes + incoming_bytes > max_bytes
        {
            let victim = inner
                .entries
                .iter()
                .min_by(|a, b| {
                    a.1.last_accessed
                        .partial_cmp(&b.1.last_accessed)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(k, _)| k.clone());

            let Some(key) = victim else { break };
            let Some(entry) = inner.entries.remove(&key) else { break };
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
            inner.stats.evictions += 1;

            if !entry.is_expired(now) {
                Self::disk_put(inner, &key, &entry);
            }
        }
    }

    // ------------------------------------------------------------------
    // Disk tier helpers
    // ------------------------------------------------------------------

    fn disk_put(inner: &mut CacheInner, key: &str, entry: &MemoryEntry) {
        let Some(conn) = inner.disk.as_ref() else { return };
        let tags = serde_json::to_string(&entry.tags).unwrap_or_else(|_| "[]".to_string());
        let result = conn.execute(
            "INSERT OR REPLACE INTO cache_entries
             (key, value, created_at, last_accessed, access_count, ttl, size_bytes, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                key,
                entry.value,
                entry.created_at,
                entry.last_accessed,
                entry.access_count as i64,
                entry.ttl_secs,
                entry.size_bytes as i64,
                tags
            ],
        );
        if let Err(e) = result {
            tracing::warn!("disk cache write failed for {}: {}", key, e);
        }
    }

    /// Read and delete a disk entry; expired rows are dropped on sight.
    fn disk_take(inner: &mut CacheInner, key: &str, now: f64) -> Option<MemoryEntry> {
        let conn = inner.disk.as_ref()?;
        let row = conn
            .query_row(
                "SELECT value, created_at, access_count, ttl, size_bytes, tags
                 FROM cache_entries WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .ok()?;

        let _ = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]);

        let (value, created_at, access_count, ttl_secs, size_bytes, tags) = row;
        let entry = MemoryEntry {
            value,
            created_at,
            last_accessed: now,
            access_count: access_count.max(0) as u64 + 1,
            ttl_secs,
            size_bytes: size_bytes.max(0) as usize,
            tags: serde_json::from_str(&tags).unwrap_or_default(),
        };

        if entry.is_expired(now) {
            return None;
        }
        Some(entry)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop every entry carrying any of `tags`, in both tiers.
    pub fn invalidate_by_tags(&self, tags: &[String]) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };

        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.tags.iter().any(|t| tags.contains(t)))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = keys.len();
        for key in keys {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
            }
        }

        if let Some(conn) = inner.disk.as_ref() {
            for tag in tags {
                // Tags are stored as a JSON array, so the quoted form is an
                // exact-element match.
                let pattern = format!("%\"{}\"%", tag);
                match conn.execute(
                    "DELETE FROM cache_entries WHERE tags LIKE ?1",
                    params![pattern],
                ) {
                    Ok(n) => removed += n,
                    Err(e) => tracing::warn!("disk cache invalidation failed: {}", e),
                }
            }
        }

        removed
    }

    /// Remove expired entries from both tiers. Returns the count removed.
    pub fn cleanup_expired(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let now = now_secs();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = expired.len();
        for key in expired {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
            }
        }

        if let Some(conn) = inner.disk.as_ref() {
            match conn.execute(
                "DELETE FROM cache_entries WHERE ?1 - created_at > ttl",
                params![now],
            ) {
                Ok(n) => removed += n,
                Err(e) => tracing::warn!("disk cache cleanup failed: {}", e),
            }
        }

        removed
    }

    /// Empty both tiers. Counters survive.
    pub fn clear(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.entries.clear();
        inner.total_bytes = 0;
        if let Some(conn) = inner.disk.as_ref() {
            if let Err(e) = conn.execute("DELETE FROM cache_entries", []) {
                tracing::warn!("disk cache clear failed: {}", e);
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let Ok(inner) = self.inner.lock() else {
            return CacheStats::default();
        };
        let mut stats = inner.stats.clone();
        stats.memory_entries = inner.entries.len();
        stats.memory_bytes = inner.total_bytes;
        stats
    }
}

// ============================================================================
// Tests
// ============================================================================
