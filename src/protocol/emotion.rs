//! Emotion tag grammar
//!
//! The LLM is instructed to prefix every sentence with an `[[emotion:x]]`
//! tag from a closed set. This module parses and strips those tags and
//! falls back to a bilingual keyword heuristic when a sentence arrives
//! untagged.

use serde::{Deserialize, Serialize};

/// Closed set of emotions carried on reply and audio chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Surprised,
    Thinking,
    Confused,
    Laughing,
    Neutral,
    Angry,
    Love,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprised => "surprised",
            Emotion::Thinking => "thinking",
            Emotion::Confused => "confused",
            Emotion::Laughing => "laughing",
            Emotion::Neutral => "neutral",
            Emotion::Angry => "angry",
            Emotion::Love => "love",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "happy" => Some(Emotion::Happy),
            "sad" => Some(Emotion::Sad),
            "surprised" => Some(Emotion::Surprised),
            "thinking" => Some(Emotion::Thinking),
            "confused" => Some(Emotion::Confused),
            "laughing" => Some(Emotion::Laughing),
            "neutral" => Some(Emotion::Neutral),
            "angry" => Some(Emotion::Angry),
            "love" => Some(Emotion::Love),
            _ => None,
        }
    }

    pub fn all() -> &'static [Emotion] {
        &[
            Emotion::Happy,
            Emotion::Sad,
            Emotion::Surprised,
            Emotion::Thinking,
            Emotion::Confused,
            Emotion::Laughing,
            Emotion::Neutral,
            Emotion::Angry,
            Emotion::Love,
        ]
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a leading `[[emotion:x]]` tag and strip every tag occurrence.
///
/// Returns the emotion named by the leading tag (if any and valid) and the
/// cleaned text with no tag substrings remaining. An empty input yields
/// `(None, "")`.
pub fn parse_and_strip(text: &str) -> (Option<Emotion>, String) {
    let trimmed = text.trim_start();
    let leading = leading_tag(trimmed).and_then(|label| Emotion::from_label(label));
    let clean = strip_tags(text);
    (leading, clean)
}

/// Remove every `[[emotion:...]]` substring and tidy surrounding whitespace
pub fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[[emotion:") {
        out.push_str(&rest[..start]);
        match rest[start..].find("]]") {
            Some(end) => rest = &rest[start + end + 2..],
            None => {
                // Unterminated tag: keep it verbatim, nothing sane to strip
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn leading_tag(text: &str) -> Option<&str> {
    let body = text.strip_prefix("[[emotion:")?;
    let end = body.find("]]")?;
    Some(&body[..end])
}

/// Keyword heuristic for untagged sentences.
///
/// Scans a small bilingual (Spanish/English) lexicon, then falls back on
/// punctuation before settling on neutral.
pub fn infer(text: &str) -> Emotion {
    let lower = text.to_lowercase();

    const LEXICON: &[(Emotion, &[&str])] = &[
        (Emotion::Laughing, &["jaja", "jeje", "haha", "lol", "qué risa", "hilarious", "funny"]),
        (Emotion::Happy, &["genial", "excelente", "perfecto", "me alegro", "great", "awesome", "glad", "wonderful", "felicidades", "congrat"]),
        (Emotion::Sad, &["lo siento", "lamento", "triste", "sorry", "unfortunately", "sadly", "qué pena"]),
        (Emotion::Surprised, &["increíble", "wow", "guau", "no puedo creer", "amazing", "unbelievable", "sorprendente"]),
        (Emotion::Thinking, &["déjame pensar", "veamos", "hmm", "let me think", "considering", "depende", "it depends"]),
        (Emotion::Confused, &["no entiendo", "no estoy seguro", "confuso", "not sure", "i don't understand", "unclear"]),
        (Emotion::Angry, &["molesto", "enojado", "furioso", "angry", "furious", "outrageous", "indignante"]),
        (Emotion::Love, &["te quiero", "me encanta", "encantador", "i love", "lovely", "adorable", "cariño"]),
    ];

    for (emotion, keywords) in LEXICON {
        if keywords.iter().any(|k| lower.contains(k)) {
            return *emotion;
        }
    }

    // Punctuation fallbacks
    if lower.contains("!?") || lower.contains("?!") {
        return Emotion::Surprised;
    }
    if text.contains('¡') || text.ends_with('!') {
        return Emotion::Happy;
    }
    if text.contains('¿') || text.ends_with('?') {
        return Emotion::Thinking;
    }

    Emotion::Neutral
}
