//! Post-stream reply extraction
//!
//! Once the LLM stream completes, long fenced code blocks become artifact
//! envelopes and a trailing `[[buttons:...]]` tag becomes a buttons
//! envelope. Both are removed from the spoken text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Minimum fenced-block length to extract as an artifact
const ARTIFACT_MIN_CHARS: usize = 200;

static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```([a-zA-Z0-9_+-]*)\n(.*?)```").expect("fence regex")
});

static BUTTONS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[\[buttons:([^\]]+)\]\]\s*$").expect("buttons regex")
});

/// A code block lifted out of the reply for out-of-band display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub language: String,
    pub title: String,
    pub content: String,
}

/// One quick-reply option offered to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonOption {
    pub text: String,
    pub value: String,
}

/// Extract fenced code blocks longer than the artifact threshold.
///
/// Returns the artifacts and the text with extracted blocks removed.
/// Short fences stay inline.
pub fn extract_artifacts(text: &str) -> (Vec<Artifact>, String) {
    let mut artifacts = Vec::new();
    let mut remaining = String::with_capacity(text.len());
    let mut last = 0;

    for caps in FENCE_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        let language = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
        let content = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim_end().to_string();

        if content.len() > ARTIFACT_MIN_CHARS {
            remaining.push_str(&text[last..whole.start()]);
            last = whole.end();
            let title = artifact_title(&language, &content);
            artifacts.push(Artifact { language, title, content });
        }
    }
    remaining.push_str(&text[last..]);

    (artifacts, remaining.trim().to_string())
}

fn artifact_title(language: &str, content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    if !first_line.is_empty() && first_line.len() <= 60 {
        first_line.to_string()
    } else if language.is_empty() {
        "Code".to_string()
    } else {
        format!("{} snippet", language)
    }
}

/// Extract a trailing `[[buttons:opt1|opt2]]` tag.
///
/// At most one buttons tag is honoured and only in trailing position.
/// Returns the options and the text with the tag removed.
pub fn extract_buttons(text: &str) -> (Vec<ButtonOption>, String) {
    let trimmed = text.trim_end();
    if let Some(caps) = BUTTONS_RE.captures(trimmed) {
        let whole = caps.get(0).expect("match");
        let options = caps
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or("")
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| ButtonOption { text: s.to_string(), value: s.to_string() })
            .collect::<Vec<_>>();
        let rest = trimmed[..whole.start()].trim_end().to_string();
        if !options.is_empty() {
            return (options, rest);
        }
    }
    (Vec::new(), text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_fences_stay_inline() {
        let text = "Use this:\n```rust\nlet x = 1;\n```\nDone.";
        let (artifacts, rest) = extract_artifacts(text);
        assert!(artifacts.is_empty());
        assert_eq!(rest, text.trim());
    }

    #[test]
    fn long_fences_become_artifacts() {
        let body = "fn main() {\n".to_string() + &"    println!(\"x\");\n".repeat(20) + "}";
        let text = format!("Here you go:\n```rust\n{}\n```\nEnjoy.", body);
        let (artifacts, rest) = extract_artifacts(&text);
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].language, "rust");
        assert_eq!(artifacts[0].title, "fn main() {");
        assert!(artifacts[0].content.len() > 200);
        assert!(!rest.contains("```"));
        assert!(rest.contains("Enjoy."));
    }

    #[test]
    fn trailing_buttons_extracted() {
        let (options, rest) = extract_buttons("Pick one. [[buttons:Yes|No|Maybe]]");
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].text, "Yes");
        assert_eq!(options[2].value, "Maybe");
        assert_eq!(rest, "Pick one.");
    }

    #[test]
    fn non_trailing_buttons_ignored() {
        let text = "[[buttons:Yes|No]] Pick one.";
        let (options, rest) = extract_buttons(text);
        assert!(options.is_empty());
        assert_eq!(rest, text);
    }

    #[test]
    fn no_buttons_is_passthrough() {
        let (options, rest) = extract_buttons("Nothing here.");
        assert!(options.is_empty());
        assert_eq!(rest, "Nothing here.");
    }
}
