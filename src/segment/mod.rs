//! Lightweight CJK keyword extraction.
//!
//! No dictionary segmenter: queries are short, so 2–3 character windows
//! over CJK runs plus a stop-word filter are enough to drive the text
//! fallback search and context analysis.

use std::collections::HashSet;

use regex::Regex;

/// Single characters and function words that carry no retrieval signal.
const STOPWORDS: [&str; 24] = [
    "的", "是", "在", "有", "和", "与", "了", "不", "也", "都", "很", "就",
    "要", "会", "能", "这", "那", "而且", "然后", "一个", "什么", "怎么",
    "可以", "我们",
];

/// CJK unified ideograph check.
#[inline]
pub fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

// ============================================================================
// KeywordExtractor
// ============================================================================

/// Extracts search keywords from freeform query text.
pub struct KeywordExtractor {
    stopwords: HashSet<&'static str>,
    punctuation: Regex,
}

impl Default for KeywordExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordExtractor {
    pub fn new() -> Self {
        Self {
            stopwords: STOPWORDS.iter().copied().collect(),
            punctuation: Regex::new(r#"[，。！？、；：""''（）()《》【】\[\]<>…—·,.!?;:"']"#)
                .unwrap(),
        }
    }

    /// Replace punctuation with spaces so runs split cleanly.
    pub fn strip_punctuation(&self, text: &str) -> String {
        self.punctuation.replace_all(text, " ").into_owned()
    }

    /// Extract up to `max_keywords` candidates, order-preserving, deduped.
    ///
    /// CJK runs contribute the run itself (2–3 chars) or its bigrams
    /// (longer runs); ASCII words of 2+ characters pass through lowercased.
    pub fn extract_keywords(&self, text: &str, max_keywords: usize) -> Vec<String> {
        let cleaned = self.strip_punctuation(text);
        let mut keywords: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let mut cjk_run: Vec<char> = Vec::new();
        let mut ascii_run = String::new();

        // Trailing space forces a final flush.
        for c in cleaned.chars().chain(std::iter::once(' ')) {
            if is_cjk(c) {
                self.flush_ascii(&mut ascii_run, &mut keywords, &mut seen, max_keywords);
                cjk_run.push(c);
            } else if c.is_ascii_alphanumeric() {
                self.flush_cjk(&mut cjk_run, &mut keywords, &mut seen, max_keywords);
                ascii_run.push(c);
            } else {
                self.flush_cjk(&mut cjk_run, &mut keywords, &mut seen, max_keywords);
                self.flush_ascii(&mut ascii_run, &mut keywords, &mut seen, max_keywords);
            }
        }

        keywords
    }

    fn flush_cjk(
        &self,
        run: &mut Vec<char>,
        keywords: &mut Vec<String>,
        seen: &mut HashSet<String>,
        max_keywords: usize,
    ) {
        match run.len() {
            0 | 1 => {}
            2 | 3 => self.push_keyword(run.iter().collect(), keywords, seen, max_keywords),
            _ => {
                for window in run.windows(2) {
                    self.push_keyword(window.iter().collect(), keywords, seen, max_keywords);
                }
            }
        }
        run.clear();
    }

    fn flush_ascii(
        &self,
        run: &mut String,
        keywords: &mut Vec<String>,
        seen: &mut HashSet<String>,
        max_keywords: usize,
    ) {
        if run.chars().count() >= 2 {
            self.push_keyword(run.to_lowercase(), keywords, seen, max_keywords);
        }
        run.clear();
    }

    fn push_keyword(
        &self,
        word: String,
        keywords: &mut Vec<String>,
        seen: &mut HashSet<String>,
        max_keywords: usize,
    ) {
        if keywords.len() >= max_keywords {
            return;
        }
        if self.stopwords.contains(word.as_str()) {
            return;
        }
        // A stop character anywhere poisons the candidate (e.g. "的了").
        let mut buf = [0u8; 4];
        if word
            .chars()
            .any(|c| self.stopwords.contains(c.encode_utf8(&mut buf) as &str))
        {
            return;
        }
        if seen.insert(word.clone()) {
            keywords.push(word);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_cjk() {
        assert!(is_cjk('山'));
        assert!(is_cjk('海'));
        assert!(!is_cjk('a'));
        assert!(!is_cjk('。'));
    }

    #[test]
    fn test_short_run_kept_whole() {
        let extractor = KeywordExtractor::new();
        let keywords = extractor.extract_keywords("青云山", 5);
        assert_eq!(keywords, vec!["青云山".to_string()]);
    }

    #[test]
    fn test_long_run_split_into_bigrams() {
        let extractor = KeywordExtractor::new();
        let keywords = extractor.extract_keywords("主角前往东海龙宫", 10);
        assert!(keywords.contains(&"主角".to_string()));
        assert!(keywords.contains(&"龙宫".to_string()));
    }

    #[test]
    fn test_stopwords_filtered() {
        let extractor = KeywordExtractor::new();
        let keywords = extractor.extract_keywords("他是在的了", 10);
        assert!(keywords.is_empty());
    }

    #[test]
    fn test_punctuation_splits_runs() {
        let extractor = KeywordExtractor::new();
        let keywords = extractor.extract_keywords("张三，李四。", 10);
        assert_eq!(keywords, vec!["张三".to_string(), "李四".to_string()]);
    }

    #[test]
    fn test_ascii_words_lowercased() {
        let extractor = KeywordExtractor::new();
        let keywords = extractor.extract_keywords("搜索 Rust 文档", 10);
        assert!(keywords.contains(&"rust".to_string()));
    }

    #[test]
    fn test_max_keywords_cap() {
        let extractor = KeywordExtractor::new();
        let keywords = extractor.extract_keywords("东南西北中发白金木水火土雷风", 3);
        assert!(keywords.len() <= 3);
    }

    #[test]
    fn test_dedup_preserves_first_occurrence() {
        let extractor = KeywordExtractor::new();
        let keywords = extractor.extract_keywords("龙宫 龙宫 宝剑", 10);
        assert_eq!(keywords, vec!["龙宫".to_string(), "宝剑".to_string()]);
    }
}
