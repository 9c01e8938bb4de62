//! Heuristic search-intent detection
//!
//! Deterministic pattern test over the raw utterance. On a match the query
//! is extracted (lead-ins stripped, bounded length) and up to five search
//! results are appended to the user text before the LLM sees it.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::services::search::SearchResult;

/// Upper bound on extracted query length
pub const MAX_QUERY_CHARS: usize = 80;

static SEARCH_VERB_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(search|google|look up|find out|busca|buscame|búscame|googlea|averigua)\b")
        .expect("search verb regex")
});

static OPENER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[¿¡\s]*(what is|what's|who is|who's|how to|qué es|quién es|cómo se|cuál es)\b")
        .expect("opener regex")
});

static CATEGORY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(news|noticias|price of|precio de|weather|clima|tiempo en|what time|qué hora|where is|dónde queda|dónde está)\b",
    )
    .expect("category regex")
});

static LEADIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(please |por favor )?(can you |could you |puedes |podrías )?(search( for)?|google|look up|find out( about)?|busca|buscame|búscame|googlea|averigua)\b\s*",
    )
    .expect("leadin regex")
});

static OPENER_STRIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[¿¡\s]*(what is|what's|who is|who's|how to|qué es|quién es|cómo se|cuál es)\s+")
        .expect("opener strip regex")
});

/// Does the utterance ask for information worth searching?
pub fn detect(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    SEARCH_VERB_RE.is_match(trimmed)
        || OPENER_RE.is_match(trimmed)
        || CATEGORY_RE.is_match(trimmed)
}

/// Extract a search query from a matched utterance.
///
/// Strips opening interrogatives and lead-ins, trims trailing punctuation,
/// and bounds the result to [`MAX_QUERY_CHARS`]. Returns `None` when
/// nothing usable remains.
pub fn extract_query(text: &str) -> Option<String> {
    let mut query = text.trim().to_string();

    query = LEADIN_RE.replace(&query, "").to_string();
    query = OPENER_STRIP_RE.replace(&query, "").to_string();

    let query = query
        .trim()
        .trim_end_matches(['?', '.', '!', ','])
        .trim()
        .to_string();

    if query.is_empty() {
        return None;
    }

    if query.chars().count() > MAX_QUERY_CHARS {
        Some(query.chars().take(MAX_QUERY_CHARS).collect())
    } else {
        Some(query)
    }
}

/// Append search results to the user text as a grounding block.
pub fn inject_results(user_text: &str, query: &str, results: &[SearchResult]) -> String {
    if results.is_empty() {
        return user_text.to_string();
    }

    let mut block = format!("{}\n\n[Web search results for \"{}\":", user_text, query);
    for (i, r) in results.iter().enumerate() {
        block.push_str(&format!("\n{}. {} - {} ({})", i + 1, r.title, r.snippet, r.url));
    }
    block.push_str("\nCite these briefly if relevant.]");
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_explicit_verbs() {
        assert!(detect("search for rust async runtimes"));
        assert!(detect("búscame el precio del dólar"));
        assert!(detect("can you google the capital of mongolia"));
    }

    #[test]
    fn detects_openers_and_categories() {
        assert!(detect("what is the boiling point of lead"));
        assert!(detect("¿qué es la fotosíntesis?"));
        assert!(detect("any news about the election?"));
        assert!(detect("what time is it in Tokyo"));
    }

    #[test]
    fn ignores_plain_chat() {
        assert!(!detect("me gustó mucho la película"));
        assert!(!detect("thanks, that was helpful"));
        assert!(!detect(""));
    }

    #[test]
    fn extraction_strips_leadins() {
        assert_eq!(
            extract_query("can you search for rust async runtimes?").as_deref(),
            Some("rust async runtimes")
        );
        assert_eq!(
            extract_query("what is the boiling point of lead").as_deref(),
            Some("the boiling point of lead")
        );
    }

    #[test]
    fn extraction_bounds_length() {
        let long = format!("search for {}", "x".repeat(200));
        let q = extract_query(&long).unwrap();
        assert!(q.chars().count() <= MAX_QUERY_CHARS);
        assert!(!q.is_empty());
    }

    #[test]
    fn extraction_of_bare_verb_is_none() {
        assert_eq!(extract_query("search"), None);
    }

    #[test]
    fn injection_appends_block() {
        let results = vec![SearchResult {
            title: "T".into(),
            snippet: "S".into(),
            url: "https://e.com".into(),
        }];
        let out = inject_results("what is T?", "T", &results);
        assert!(out.starts_with("what is T?"));
        assert!(out.contains("1. T - S (https://e.com)"));
        assert!(out.contains("Cite these briefly"));
        assert_eq!(inject_results("hola", "q", &[]), "hola");
    }
}
