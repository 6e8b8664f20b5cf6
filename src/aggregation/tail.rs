//! Tail carry: holding back the last fragment of a soft commit.

use crate::aggregation::decision::AggregationTuning;
use crate::aggregation::dedup::{append_deduped, uses_char_units};

const SENTENCE_END: &[char] = &['.', '!', '?', ';', ',', '。', '！', '？', '；', '，', '、'];

/// Splits `text` into `(body, tail)` at a language-aware boundary.
///
/// Text ending in punctuation has no tail. CJK text withholds the last
/// `tail_carry_chars` characters; other text the last `tail_carry_words` words.
pub fn split_tail(text: &str, lang: &str, tuning: &AggregationTuning) -> (String, String) {
    let trimmed = text.trim_end();
    if trimmed.is_empty() || trimmed.ends_with(SENTENCE_END) {
        return (trimmed.to_string(), String::new());
    }

    if uses_char_units(trimmed, lang) {
        let chars: Vec<char> = trimmed.chars().collect();
        let keep = chars.len().saturating_sub(tuning.tail_carry_chars);
        let body: String = chars[..keep].iter().collect();
        let tail: String = chars[keep..].iter().collect();
        return (body.trim_end().to_string(), tail.trim_start().to_string());
    }

    let mut cut = trimmed.len();
    for _ in 0..tuning.tail_carry_words {
        match trimmed[..cut].trim_end().rfind(char::is_whitespace) {
            Some(pos) => cut = pos,
            None => {
                cut = 0;
                break;
            }
        }
    }
    (
        trimmed[..cut].trim_end().to_string(),
        trimmed[cut..].trim().to_string(),
    )
}

/// Produces the text to emit for a commit and updates the retained tail.
///
/// A hard boundary (final result or manual cut) emits everything, including any
/// previously retained tail, and leaves nothing behind. Otherwise the trailing
/// fragment is withheld in `tail_buffer` unless that would leave nothing to emit.
pub fn extract_commit_text(
    pending_text: &str,
    tail_buffer: &mut String,
    hard_boundary: bool,
    lang: &str,
    tuning: &AggregationTuning,
) -> String {
    let (combined, _) = append_deduped(tail_buffer, pending_text.trim(), lang);
    tail_buffer.clear();
    let combined = combined.trim().to_string();

    if hard_boundary {
        return combined;
    }

    let (body, tail) = split_tail(&combined, lang, tuning);
    if body.is_empty() {
        return combined;
    }
    *tail_buffer = tail;
    body
}
