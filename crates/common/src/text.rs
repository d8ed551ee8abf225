//! Small text utilities shared by routing, lifecycle and recall

use std::collections::HashSet;

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being",
    "in", "on", "at", "to", "for", "of", "with", "by", "from", "about",
    "and", "or", "but", "not", "this", "that", "these", "those", "there",
    "it", "its", "as", "do", "does", "did", "has", "have", "had",
    "can", "could", "will", "would", "should", "may", "might", "must",
    "i", "me", "my", "we", "our", "us", "you", "your", "they", "them", "their",
    "what", "which", "who", "whom", "when", "where", "why", "how",
    "any", "some", "all", "more", "most", "other", "such", "than", "too", "very",
    "just", "also", "into", "over", "then", "so", "if", "up", "out", "no",
    "tell", "please", "know", "want", "like", "get", "give", "let", "lets",
];

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Lowercased content words, in order of first appearance, without duplicates
pub fn keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(|w| w.trim_matches('-'))
        .filter(|w| w.len() > 2 && !is_stop_word(w))
        .filter(|w| seen.insert(w.to_string()))
        .map(str::to_string)
        .collect()
}

pub fn keyword_set(text: &str) -> HashSet<String> {
    keywords(text).into_iter().collect()
}

/// Truncate to at most `max_chars` characters on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Whitespace-normalized lowercase form used for phrase matching
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether `text` contains any of `phrases` as a whole-word phrase
pub fn contains_any_phrase(text: &str, phrases: &[&str]) -> bool {
    let padded = format!(" {} ", normalize(text));
    phrases
        .iter()
        .any(|p| padded.contains(&format!(" {} ", normalize(p))))
}

/// Slice out the outermost JSON object from model output that may be
/// wrapped in prose or code fences.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_filter_and_dedup() {
        let words = keywords("What is the effect of Statins on dementia? Statins again.");
        assert_eq!(words, vec!["effect", "statins", "dementia", "again"]);
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn test_phrase_matching_whole_words() {
        assert!(contains_any_phrase("OK, thanks, that's all!", &["that's all"]));
        assert!(!contains_any_phrase("thatsall", &["that's all"]));
        assert!(!contains_any_phrase("new topical review", &["new topic"]));
    }

    #[test]
    fn test_extract_json_object() {
        let raw = "Sure:\n```json\n{\"sufficient\": true}\n```";
        assert_eq!(extract_json_object(raw), Some("{\"sufficient\": true}"));
        assert_eq!(extract_json_object("no json"), None);
    }
}
