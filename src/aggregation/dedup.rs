//! Overlap removal between consecutive text fragments.
//!
//! Streaming ASR re-emits the tail of the previous result at the head of the
//! next one. These helpers find that overlap character-exactly and strip it.

use crate::defaults;
use serde::{Deserialize, Serialize};

/// Result of [`dedup_merge_precise`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupResult {
    /// `b` with the overlapping prefix removed.
    pub text: String,
    pub deduped: bool,
    /// Overlap length in characters.
    pub overlap_chars: usize,
}

/// Strips the longest suffix of `a` that is also a prefix of `b` from `b`.
///
/// Comparison is character-exact and limited to the last
/// [`DEDUP_SEARCH_WINDOW_CHARS`](defaults::DEDUP_SEARCH_WINDOW_CHARS) characters.
pub fn dedup_merge_precise(a: &str, b: &str) -> DedupResult {
    dedup_within_window(a, b, defaults::DEDUP_SEARCH_WINDOW_CHARS)
}

/// [`dedup_merge_precise`] with an explicit search window.
pub fn dedup_within_window(a: &str, b: &str, window: usize) -> DedupResult {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_overlap = a_chars.len().min(b_chars.len()).min(window);

    let overlap = (1..=max_overlap)
        .rev()
        .find(|&len| a_chars[a_chars.len() - len..] == b_chars[..len])
        .unwrap_or(0);

    DedupResult {
        text: b_chars[overlap..].iter().collect(),
        deduped: overlap > 0,
        overlap_chars: overlap,
    }
}

/// True for languages written without spaces between words.
pub fn is_cjk_lang(lang: &str) -> bool {
    let lang = lang.to_ascii_lowercase();
    ["zh", "ja", "ko", "yue"]
        .iter()
        .any(|prefix| lang == *prefix || lang.starts_with(&format!("{}-", prefix)))
}

pub fn is_cjk_char(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'   // Hiragana, Katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified ideographs
        | '\u{AC00}'..='\u{D7AF}' // Hangul syllables
        | '\u{3000}'..='\u{303F}' // CJK punctuation
        | '\u{FF00}'..='\u{FFEF}' // Fullwidth forms
    )
}

/// Whether `text` should be handled with character (not word) granularity.
pub fn uses_char_units(text: &str, lang: &str) -> bool {
    is_cjk_lang(lang) || text.chars().any(is_cjk_char)
}

/// Joins two fragments with a separator appropriate for the language.
pub fn join_fragments(head: &str, tail: &str, lang: &str) -> String {
    if head.is_empty() {
        return tail.to_string();
    }
    if tail.is_empty() {
        return head.to_string();
    }
    let needs_space = !uses_char_units(head, lang)
        && !head.ends_with(char::is_whitespace)
        && !tail.starts_with(char::is_whitespace);
    if needs_space {
        format!("{} {}", head, tail)
    } else {
        format!("{}{}", head, tail)
    }
}

/// Appends `incoming` to `existing` after stripping their overlap.
pub fn append_deduped(existing: &str, incoming: &str, lang: &str) -> (String, DedupResult) {
    let dedup = dedup_merge_precise(existing, incoming);
    let merged = join_fragments(existing, &dedup.text, lang);
    (merged, dedup)
}
