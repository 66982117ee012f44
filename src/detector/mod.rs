//! Codex reference detection.
//!
//! Finds mentions of codex entries (characters, locations, objects) in
//! freeform prose and scores each candidate with a calibrated confidence.
//! Candidates run through a fixed filter pipeline before scoring:
//!
//! 1. exact-match scan over titles and aliases
//! 2. token boundary validation (script-aware; CJK has no word breaks)
//! 3. negative-context filter with contrastive-connective override
//! 4. compound-word filter (match is a prefix of a longer known term)
//! 5. time / quantity / curated false-positive filters
//!
//! A candidate dropped by any filter never reaches scoring. All positions
//! are character offsets.

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::codex::{Codex, CodexEntry, CodexEntryType};
use crate::segment::is_cjk;

// ============================================================================
// Detection Configuration
// ============================================================================

/// Detector settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Candidates below this confidence are dropped.
    pub min_confidence: f32,
    /// Titles/aliases shorter than this are never scanned for.
    pub min_term_length: usize,
    /// Characters of context captured on each side of a match.
    pub context_window: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.65,
            min_term_length: 2,
            context_window: 50,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// A confirmed mention of a codex entry.
#[derive(Debug, Clone, Serialize)]
pub struct DetectedReference {
    pub entry_id: String,
    pub entry_title: String,
    pub entry_type: CodexEntryType,
    pub matched_text: String,
    /// Start offset in characters (inclusive).
    pub start_pos: usize,
    /// End offset in characters (exclusive).
    pub end_pos: usize,
    pub confidence: f32,
    pub context_before: String,
    pub context_after: String,
}

/// Detector configuration summary for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionStats {
    pub min_confidence: f32,
    pub min_term_length: usize,
    pub time_pattern_count: usize,
    pub false_positive_count: usize,
    pub compound_term_count: usize,
}

// ============================================================================
// Constants
// ============================================================================

/// Characters scanned backward for negation markers.
const NEGATION_WINDOW: usize = 20;

/// Characters scanned on each side for context keywords.
const CONTEXT_SCAN: usize = 10;

/// A negation marker before the match rejects it. Bare 非 is intentionally
/// absent: it appears inside intensifiers like 非常 and would reject valid
/// mentions; 并非 covers the real negation use.
const NEGATION_MARKERS: [&str; 6] = ["不是", "没有", "不叫", "并非", "不认识", "不知道"];

/// ...unless a contrastive connective re-affirms it between the negation
/// and the match ("不是X而是Y" affirms Y).
const CONTRASTIVE_MARKERS: [&str; 5] = ["而是", "但是", "不过", "然而", "可是"];

/// Literal matches that look like entity names but are calendar/counter
/// phrases ("第三次", "这个月").
const TIME_PATTERNS: [&str; 5] = [
    r"^第[一二三四五六七八九十百千\d]+次$",
    r"^[一二三四五六七八九十百千\d]+次了?$",
    r"^[这那上下][一个]?[次月周年天]$",
    r"^(昨天|今天|明天|后天|前天|现在|刚才|以前|以后)$",
    r"^[一二三四五六七八九十百千\d]+[年月日天时分秒]$",
];

/// Bare quantity phrases ("三个", "五把").
const QUANTITY_PATTERN: &str =
    r"^[一二三四五六七八九十百千万\d]+[个只条件张本块份名位把台辆颗粒根支]$";

/// High-frequency words that collide with short entry names.
const FALSE_POSITIVES: [&str; 20] = [
    "第三次", "这次", "那次", "每次", "一次", "一个", "一些", "这个", "那个",
    "什么", "怎么", "可能", "应该", "开始", "结束", "昨天", "今天", "明天",
    "时候", "地方",
];

/// Common compounds that can swallow a shorter name as their prefix.
const COMPOUND_LEXICON: [&str; 6] = ["时候", "地方", "东西", "事情", "时间", "感觉"];

// Scoring constants. The relative magnitudes matter more than the exact
// decimals: length dominates, co-occurrence and type shape are secondary.
const BASE_CONFIDENCE: f32 = 0.7;
const LENGTH_BONUS_LONG: f32 = 0.2; // 3+ characters
const LENGTH_PENALTY_SHORT: f32 = -0.3; // single character
const BOUNDARY_BONUS: f32 = 0.1; // per delimiter-or-edge side
const CONTEXT_WEIGHT: f32 = 0.15;
const TYPE_WEIGHT: f32 = 0.1;
const TITLE_MATCH_BONUS: f32 = 0.1;
const ALIAS_MATCH_BONUS: f32 = 0.05;
const GLOBAL_ENTRY_BONUS: f32 = 0.1;

/// Verbs/prepositions that co-occur with each entry category.
const CHARACTER_KEYWORDS: [char; 10] = ['说', '道', '想', '看', '听', '走', '来', '去', '笑', '哭'];
const LOCATION_KEYWORDS: [char; 10] = ['在', '到', '去', '来', '从', '向', '朝', '往', '里', '处'];
const OBJECT_KEYWORDS: [char; 10] = ['拿', '用', '持', '握', '放', '取', '给', '递', '扔', '丢'];

/// Suffixes typical of place and object names.
const LOCATION_SUFFIXES: [char; 18] = [
    '城', '镇', '村', '国', '省', '市', '区', '县', '山', '河', '湖', '海',
    '谷', '洞', '殿', '宫', '府', '庄',
];
const OBJECT_SUFFIXES: [char; 14] = [
    '剑', '刀', '枪', '弓', '书', '珠', '石', '丹', '药', '符', '印', '镜',
    '琴', '玉',
];

// ============================================================================
// ReferenceDetector
// ============================================================================

/// Scans prose for codex mentions.
pub struct ReferenceDetector {
    config: DetectionConfig,
    time_patterns: Vec<Regex>,
    quantity_pattern: Regex,
    false_positives: HashSet<String>,
    compound_lexicon: Vec<Vec<char>>,
}

impl ReferenceDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            time_patterns: TIME_PATTERNS
                .iter()
                .map(|p| Regex::new(p).unwrap())
                .collect(),
            quantity_pattern: Regex::new(QUANTITY_PATTERN).unwrap(),
            false_positives: FALSE_POSITIVES.iter().map(|s| s.to_string()).collect(),
            compound_lexicon: COMPOUND_LEXICON
                .iter()
                .map(|s| s.chars().collect())
                .collect(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DetectionConfig::default())
    }

    /// Detect all codex references in `text`, deduplicated (highest
    /// confidence wins on overlap) and sorted by position.
    pub fn detect(&self, text: &str, codex: &Codex) -> Vec<DetectedReference> {
        if text.trim().is_empty() || codex.is_empty() {
            return vec![];
        }

        let chars: Vec<char> = text.chars().collect();
        let known_terms: Vec<Vec<char>> = codex
            .known_terms()
            .map(|t| t.chars().collect())
            .collect();

        let mut candidates: Vec<DetectedReference> = Vec::new();

        for entry in codex.entries().iter().filter(|e| e.track_references) {
            for (term, is_title) in entry_terms(entry) {
                let term_chars: Vec<char> = term.chars().collect();
                if term_chars.len() < self.config.min_term_length {
                    continue;
                }

                for start in find_occurrences(&chars, &term_chars) {
                    let end = start + term_chars.len();

                    if !boundary_ok(&chars, start, end) {
                        continue;
                    }
                    if self.is_negated(&chars, start) {
                        continue;
                    }
                    if self.is_compound_fragment(&chars, start, end, &known_terms) {
                        continue;
                    }
                    if self.is_time_expression(term)
                        || self.is_quantity_expression(term)
                        || self.false_positives.contains(term)
                    {
                        continue;
                    }

                    let confidence = self.score(&chars, start, end, entry, is_title);
                    if confidence < self.config.min_confidence {
                        continue;
                    }

                    candidates.push(DetectedReference {
                        entry_id: entry.id.clone(),
                        entry_title: entry.title.clone(),
                        entry_type: entry.entry_type,
                        matched_text: term.to_string(),
                        start_pos: start,
                        end_pos: end,
                        confidence,
                        context_before: String::new(),
                        context_after: String::new(),
                    });
                }
            }
        }

        let mut accepted = dedup_overlapping(candidates);
        accepted.sort_by_key(|r| r.start_pos);

        let window = self.config.context_window;
        for reference in &mut accepted {
            let ctx_start = reference.start_pos.saturating_sub(window);
            let ctx_end = (reference.end_pos + window).min(chars.len());
            reference.context_before = chars[ctx_start..reference.start_pos].iter().collect();
            reference.context_after = chars[reference.end_pos..ctx_end].iter().collect();
        }

        tracing::debug!("detected {} references", accepted.len());
        accepted
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// Negation marker in the window before the match rejects it, unless a
    /// contrastive connective between the marker and the match re-affirms.
    fn is_negated(&self, chars: &[char], start: usize) -> bool {
        let win_start = start.saturating_sub(NEGATION_WINDOW);
        let before: String = chars[win_start..start].iter().collect();

        let mut negation_end: Option<usize> = None;
        for marker in NEGATION_MARKERS {
            if let Some(pos) = before.rfind(marker) {
                let end = pos + marker.len();
                if negation_end.map_or(true, |e| end > e) {
                    negation_end = Some(end);
                }
            }
        }

        let Some(negation_end) = negation_end else {
            return false;
        };

        !CONTRASTIVE_MARKERS
            .iter()
            .any(|m| before[negation_end..].contains(m))
    }

    /// The match is a strict prefix of a longer known term starting at the
    /// same position ("龙泉" inside "龙泉剑").
    fn is_compound_fragment(
        &self,
        chars: &[char],
        start: usize,
        end: usize,
        known_terms: &[Vec<char>],
    ) -> bool {
        let match_len = end - start;
        known_terms
            .iter()
            .chain(self.compound_lexicon.iter())
            .any(|term| {
                term.len() > match_len
                    && start + term.len() <= chars.len()
                    && chars[start..start + term.len()] == term[..]
            })
    }

    fn is_time_expression(&self, term: &str) -> bool {
        self.time_patterns.iter().any(|re| re.is_match(term))
    }

    fn is_quantity_expression(&self, term: &str) -> bool {
        self.quantity_pattern.is_match(term)
    }

    // ------------------------------------------------------------------
    // Scoring
    // ------------------------------------------------------------------

    fn score(
        &self,
        chars: &[char],
        start: usize,
        end: usize,
        entry: &CodexEntry,
        is_title: bool,
    ) -> f32 {
        let mut confidence = BASE_CONFIDENCE;
        let term = &chars[start..end];

        match term.len() {
            0 | 1 => confidence += LENGTH_PENALTY_SHORT,
            2 => {}
            _ => confidence += LENGTH_BONUS_LONG,
        }

        // Boundary quality: a delimiter or text edge on either side.
        if start == 0 || is_delimiter(chars[start - 1]) {
            confidence += BOUNDARY_BONUS;
        }
        if end == chars.len() || is_delimiter(chars[end]) {
            confidence += BOUNDARY_BONUS;
        }

        // Type-specific co-occurring verbs/prepositions nearby.
        let ctx_start = start.saturating_sub(CONTEXT_SCAN);
        let ctx_end = (end + CONTEXT_SCAN).min(chars.len());
        let keywords: &[char] = match entry.entry_type {
            CodexEntryType::Character => &CHARACTER_KEYWORDS,
            CodexEntryType::Location => &LOCATION_KEYWORDS,
            CodexEntryType::Object => &OBJECT_KEYWORDS,
            _ => &[],
        };
        if !keywords.is_empty() {
            let mut context = chars[ctx_start..start]
                .iter()
                .chain(chars[end..ctx_end].iter());
            if context.any(|c| keywords.contains(c)) {
                confidence += CONTEXT_WEIGHT;
            }
        }

        confidence += type_affinity(term, entry.entry_type) * TYPE_WEIGHT;

        confidence += if is_title {
            TITLE_MATCH_BONUS
        } else {
            ALIAS_MATCH_BONUS
        };

        if entry.is_global {
            confidence += GLOBAL_ENTRY_BONUS;
        }

        confidence.clamp(0.0, 1.0)
    }

    // ------------------------------------------------------------------
    // False-positive list management
    // ------------------------------------------------------------------

    pub fn add_false_positive(&mut self, term: &str) {
        self.false_positives.insert(term.to_string());
    }

    pub fn remove_false_positive(&mut self, term: &str) -> bool {
        self.false_positives.remove(term)
    }

    pub fn stats(&self) -> DetectionStats {
        DetectionStats {
            min_confidence: self.config.min_confidence,
            min_term_length: self.config.min_term_length,
            time_pattern_count: self.time_patterns.len(),
            false_positive_count: self.false_positives.len(),
            compound_term_count: self.compound_lexicon.len(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn entry_terms(entry: &CodexEntry) -> impl Iterator<Item = (&str, bool)> {
    std::iter::once((entry.title.as_str(), true))
        .chain(entry.aliases.iter().map(|a| (a.as_str(), false)))
}

/// All start offsets of `needle` in `haystack` (character space).
fn find_occurrences(haystack: &[char], needle: &[char]) -> Vec<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return vec![];
    }
    (0..=haystack.len() - needle.len())
        .filter(|&i| haystack[i..i + needle.len()] == *needle)
        .collect()
}

/// Script-aware boundary check. CJK text has no word delimiters, so CJK
/// neighbors never reject; a Latin/digit match flanked by more Latin/digit
/// characters is a fragment of a larger token.
fn boundary_ok(chars: &[char], start: usize, end: usize) -> bool {
    if chars[start..end].iter().any(|&c| is_cjk(c)) {
        return true;
    }
    let fragment_neighbor = |c: char| c.is_alphanumeric() && !is_cjk(c);
    if start > 0 && fragment_neighbor(chars[start - 1]) {
        return false;
    }
    if end < chars.len() && fragment_neighbor(chars[end]) {
        return false;
    }
    true
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '，' | '。' | '！' | '？' | '、' | '；' | '：' | '“' | '”' | '‘'
                | '’' | '（' | '）' | '《' | '》' | '…' | '—' | '(' | ')'
                | ',' | '.' | '!' | '?' | ';' | ':' | '"' | '\''
        )
}

/// How strongly the surface shape of `term` fits the entry category.
fn type_affinity(term: &[char], entry_type: CodexEntryType) -> f32 {
    match entry_type {
        CodexEntryType::Character => {
            if (2..=4).contains(&term.len()) && term.iter().all(|&c| is_cjk(c)) {
                1.0
            } else {
                0.5
            }
        }
        CodexEntryType::Location => {
            if term.last().is_some_and(|c| LOCATION_SUFFIXES.contains(c)) {
                1.0
            } else {
                0.7
            }
        }
        CodexEntryType::Object => {
            if term.last().is_some_and(|c| OBJECT_SUFFIXES.contains(c)) {
                1.0
            } else {
                0.6
            }
        }
        _ => 0.7,
    }
}

/// Keep the highest-confidence candidate among overlapping spans.
fn dedup_overlapping(mut candidates: Vec<DetectedReference>) -> Vec<DetectedReference> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.start_pos.cmp(&b.start_pos))
    });

    let mut kept: Vec<DetectedReference> = Vec::new();
    for candidate in candidates {
        let overlaps = kept
            .iter()
            .any(|k| candidate.start_pos < k.end_pos && candidate.end_pos > k.start_pos);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

// ============================================================================
// Tests
// ============================================================================
