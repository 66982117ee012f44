//! Codex: the structured knowledge base the detector matches against.
//!
//! Entries describe characters, locations and objects of a writing
//! project. The registry keeps title and alias lookups cheap; the editor
//! layer owns mutation and shares the registry behind a lock.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Types
// ============================================================================

/// Entry category. Influences detection scoring heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodexEntryType {
    Character,
    Location,
    Object,
    Lore,
    Subplot,
    Other,
}

impl CodexEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodexEntryType::Character => "character",
            CodexEntryType::Location => "location",
            CodexEntryType::Object => "object",
            CodexEntryType::Lore => "lore",
            CodexEntryType::Subplot => "subplot",
            CodexEntryType::Other => "other",
        }
    }
}

fn default_track_references() -> bool {
    true
}

/// A single knowledge base entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexEntry {
    pub id: String,
    pub title: String,
    pub entry_type: CodexEntryType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Global entries are relevant everywhere and score slightly higher.
    #[serde(default)]
    pub is_global: bool,
    /// Entries with tracking disabled are invisible to the detector.
    #[serde(default = "default_track_references")]
    pub track_references: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CodexEntry {
    /// Minimal entry for tests and programmatic construction.
    pub fn new(id: &str, title: &str, entry_type: CodexEntryType) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            entry_type,
            description: String::new(),
            aliases: Vec::new(),
            is_global: false,
            track_references: true,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn global(mut self) -> Self {
        self.is_global = true;
        self
    }
}

// ============================================================================
// Codex
// ============================================================================

/// Entry registry with title/alias indexes.
#[derive(Debug, Default)]
pub struct Codex {
    entries: Vec<CodexEntry>,
    by_title: HashMap<String, usize>,
    by_alias: HashMap<String, usize>,
}

impl Codex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<CodexEntry>) -> Self {
        let mut codex = Self::new();
        for entry in entries {
            codex.add_entry(entry);
        }
        codex
    }

    /// Insert or replace (matched by id).
    pub fn add_entry(&mut self, entry: CodexEntry) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == entry.id) {
            self.entries[pos] = entry;
        } else {
            self.entries.push(entry);
        }
        self.rebuild_indexes();
    }

    pub fn remove_entry(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.rebuild_indexes();
        }
        removed
    }

    fn rebuild_indexes(&mut self) {
        self.by_title.clear();
        self.by_alias.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            self.by_title.insert(entry.title.clone(), i);
            for alias in &entry.aliases {
                self.by_alias.insert(alias.clone(), i);
            }
        }
    }

    pub fn entries(&self) -> &[CodexEntry] {
        &self.entries
    }

    pub fn get_by_title(&self, title: &str) -> Option<&CodexEntry> {
        self.by_title.get(title).map(|&i| &self.entries[i])
    }

    pub fn get_by_alias(&self, alias: &str) -> Option<&CodexEntry> {
        self.by_alias.get(alias).map(|&i| &self.entries[i])
    }

    /// Every title and alias known to the registry.
    pub fn known_terms(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .flat_map(|e| std::iter::once(e.title.as_str()).chain(e.aliases.iter().map(|a| a.as_str())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let mut codex = Codex::new();
        codex.add_entry(
            CodexEntry::new("c1", "李四", CodexEntryType::Character).with_aliases(&["小四"]),
        );

        assert_eq!(codex.len(), 1);
        assert!(codex.get_by_title("李四").is_some());
        assert!(codex.get_by_alias("小四").is_some());
        assert!(codex.get_by_title("张三").is_none());
    }

    #[test]
    fn test_add_replaces_by_id() {
        let mut codex = Codex::new();
        codex.add_entry(CodexEntry::new("c1", "旧名", CodexEntryType::Character));
        codex.add_entry(CodexEntry::new("c1", "新名", CodexEntryType::Character));

        assert_eq!(codex.len(), 1);
        assert!(codex.get_by_title("旧名").is_none());
        assert!(codex.get_by_title("新名").is_some());
    }

    #[test]
    fn test_remove_entry() {
        let mut codex = Codex::from_entries(vec![
            CodexEntry::new("c1", "李四", CodexEntryType::Character),
            CodexEntry::new("l1", "青云城", CodexEntryType::Location),
        ]);

        assert!(codex.remove_entry("c1"));
        assert!(!codex.remove_entry("c1"));
        assert_eq!(codex.len(), 1);
        assert!(codex.get_by_title("李四").is_none());
    }

    #[test]
    fn test_known_terms() {
        let codex = Codex::from_entries(vec![CodexEntry::new(
            "c1",
            "李四",
            CodexEntryType::Character,
        )
        .with_aliases(&["小四", "四哥"])]);

        let terms: Vec<&str> = codex.known_terms().collect();
        assert_eq!(terms, vec!["李四", "小四", "四哥"]);
    }

    #[test]
    fn test_entry_json_defaults() {
        let entry: CodexEntry = serde_json::from_str(
            r#"{"id":"c1","title":"李四","entry_type":"character"}"#,
        )
        .unwrap();
        assert!(entry.track_references);
        assert!(!entry.is_global);
        assert!(entry.aliases.is_empty());
    }
}
