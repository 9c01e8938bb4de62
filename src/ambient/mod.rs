//! Ambient listening
//!
//! Gating logic for always-on audio segments: transcript acceptance
//! filters, the rolling noise baseline, wake-name / question trigger
//! decisions, and self-introduction detection. All decision functions are
//! pure; the session actor owns the mutable state they consume.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;

use crate::services::asr::{self, Transcript};
use crate::types::AmbientEntry;

/// Allowed transcript languages
const ALLOWED_LANGUAGES: &[&str] = &["es", "en", "spanish", "english"];

/// Segment-level average log-probability floor
const MIN_AVG_LOGPROB: f32 = -0.6;

/// Segment-level no-speech probability ceiling
const MAX_NO_SPEECH: f32 = 0.5;

/// Minimum word count in a quiet environment
const MIN_WORDS_QUIET: usize = 3;

/// Minimum word count when the noise baseline reports a noisy environment
const MIN_WORDS_NOISY: usize = 4;

/// Transcripts longer than this never count as a wake phrase
const WAKE_PHRASE_MAX_CHARS: usize = 80;

// ─── Noise baseline ──────────────────────────────────────────

/// Windowed RMS average over recent segments.
///
/// Exposes a binary "noisy environment" signal that raises the minimum
/// word count for transcript acceptance.
#[derive(Debug, Default)]
pub struct NoiseBaseline {
    window: VecDeque<f32>,
}

impl NoiseBaseline {
    /// Segments retained in the window
    const WINDOW: usize = 50;

    /// RMS average above which the environment counts as noisy
    const NOISY_RMS: f32 = 900.0;

    pub fn record(&mut self, rms: f32) {
        if self.window.len() >= Self::WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(rms);
    }

    pub fn is_noisy(&self) -> bool {
        if self.window.is_empty() {
            return false;
        }
        let avg = self.window.iter().sum::<f32>() / self.window.len() as f32;
        avg > Self::NOISY_RMS
    }

    pub fn min_words(&self) -> usize {
        if self.is_noisy() { MIN_WORDS_NOISY } else { MIN_WORDS_QUIET }
    }
}

// ─── Transcript acceptance ───────────────────────────────────

/// Why a segment was dropped, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Language,
    LowConfidence,
    NoSpeech,
    TooShort,
    Garbage,
}

/// Apply the ambient acceptance filters to a transcript.
pub fn accept_transcript(transcript: &Transcript, min_words: usize) -> Result<(), DropReason> {
    if let Some(lang) = &transcript.language {
        if !ALLOWED_LANGUAGES.contains(&lang.to_lowercase().as_str()) {
            return Err(DropReason::Language);
        }
    }
    if let Some(lp) = transcript.avg_logprob {
        if lp < MIN_AVG_LOGPROB {
            return Err(DropReason::LowConfidence);
        }
    }
    if let Some(ns) = transcript.no_speech_prob {
        if ns > MAX_NO_SPEECH {
            return Err(DropReason::NoSpeech);
        }
    }
    if transcript.text.split_whitespace().count() < min_words {
        return Err(DropReason::TooShort);
    }
    if asr::is_garbage(&transcript.text) {
        return Err(DropReason::Garbage);
    }
    Ok(())
}

// ─── Trigger decision ────────────────────────────────────────

/// Why the assistant decided to respond to an ambient utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// The wake-name appeared in the transcript
    Name,
    /// A short utterance opened with a lead-in term
    WakePhrase,
    /// A question directed at the assistant
    Question,
    /// An explicit request for the assistant's opinion
    OpinionRequest,
}

/// Outcome of the trigger decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerDecision {
    pub respond: bool,
    pub reason: Option<TriggerReason>,
}

impl TriggerDecision {
    fn silent() -> Self {
        Self { respond: false, reason: None }
    }

    fn respond(reason: TriggerReason) -> Self {
        Self { respond: true, reason: Some(reason) }
    }
}

static WAKE_LEADINS: &[&str] = &["hey", "oye", "che", "hola", "escucha", "listen", "okay", "ok"];

static QUESTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(what do you think|do you know|can you|could you|would you|qué piensas|qué opinas|sabes|puedes|podrías)\b",
    )
    .expect("question regex")
});

static OPINION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(what about you|your opinion|y tú qué|tu opinión|y vos)\b")
        .expect("opinion regex")
});

/// Case- and accent-insensitive fold for wake-name matching
pub fn fold(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Decide whether an accepted ambient utterance deserves a response.
pub fn decide_trigger(text: &str, wake_name: &str) -> TriggerDecision {
    let folded = fold(text);
    let folded_name = fold(wake_name);

    if !folded_name.is_empty() && folded.contains(&folded_name) {
        return TriggerDecision::respond(TriggerReason::Name);
    }

    if text.len() < WAKE_PHRASE_MAX_CHARS {
        let first = folded
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_alphanumeric());
        if WAKE_LEADINS.contains(&first) {
            return TriggerDecision::respond(TriggerReason::WakePhrase);
        }
    }

    if OPINION_RE.is_match(text) {
        return TriggerDecision::respond(TriggerReason::OpinionRequest);
    }

    if QUESTION_RE.is_match(text) {
        return TriggerDecision::respond(TriggerReason::Question);
    }

    TriggerDecision::silent()
}

/// Strip the wake-name and its lead-in from a triggering utterance,
/// leaving the actual request ("Che jarvis, ¿qué hora es?" becomes
/// "¿qué hora es?").
pub fn strip_wake_name(text: &str, wake_name: &str) -> String {
    let folded = fold(text);
    let folded_name = fold(wake_name);
    if folded_name.is_empty() {
        return text.trim().to_string();
    }

    match folded.find(&folded_name) {
        Some(start) => {
            // Folding maps chars 1:1 for the supported languages, so char
            // counts line up between the folded and original strings.
            let end_chars = folded[..start].chars().count() + folded_name.chars().count();
            let remainder: String = text.chars().skip(end_chars).collect();
            let cleaned = remainder
                .trim()
                .trim_start_matches([',', '.', ':', ';', '!', '?', '-'])
                .trim();
            if cleaned.is_empty() {
                text.trim().to_string()
            } else {
                cleaned.to_string()
            }
        }
        None => text.trim().to_string(),
    }
}

// ─── Self-introduction detection ─────────────────────────────

static INTRO_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i:\bmy name is)\s+(\p{L}[\p{L} ]{0,30})",
        r"(?i:\bi'?m)\s+(\p{Lu}\p{L}{1,19})\b",
        r"(?i:\bcall me)\s+(\p{L}[\p{L} ]{0,30})",
        r"(?i:\bme llamo)\s+(\p{L}[\p{L} ]{0,30})",
        r"(?i:\bmi nombre es)\s+(\p{L}[\p{L} ]{0,30})",
        r"(?i:\bsoy)\s+(\p{Lu}\p{L}{1,19})\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("intro regex"))
    .collect()
});

/// Words that pattern-match an introduction but are not names
static NAME_BLACKLIST: &[&str] = &[
    "sorry", "sure", "here", "good", "fine", "okay", "busy", "tired", "ready", "done", "back",
    "listo", "bien", "aquí", "cansado", "seguro", "yo",
];

/// Detect "my name is X" style self-introductions.
///
/// Returns the captured name when it clears the blacklist and the 2–20
/// character window.
pub fn detect_self_intro(text: &str) -> Option<String> {
    for re in INTRO_RES.iter() {
        if let Some(caps) = re.captures(text) {
            let candidate = caps.get(1)?.as_str().trim();
            // Take the first word of multi-word captures
            let name = candidate.split_whitespace().next().unwrap_or("");
            let len = name.chars().count();
            if len < 2 || len > 20 {
                continue;
            }
            if NAME_BLACKLIST.contains(&fold(name).as_str()) {
                continue;
            }
            return Some(capitalize(name));
        }
    }
    None
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

// ─── Context wrapper ─────────────────────────────────────────

/// Marker prefix on pipeline input that came from ambient context; the
/// search-injection step skips inputs carrying it.
pub const AMBIENT_MARKER: &str = "[Ambient conversation context:";

/// Build the multi-line context wrapper submitted for non-name triggers.
pub fn ambient_wrapper(context: &[AmbientEntry], current: &AmbientEntry) -> String {
    let mut lines = Vec::new();
    let recent: Vec<&AmbientEntry> = context
        .iter()
        .filter(|e| e.timestamp != current.timestamp || e.text != current.text)
        .rev()
        .take(5)
        .collect();

    let mut header = String::from(AMBIENT_MARKER);
    for entry in recent.iter().rev() {
        header.push_str(&format!("\n  {}: {}", entry.speaker, entry.text));
    }
    header.push(']');
    lines.push(header);
    lines.push(format!("[Speaker just said: {}: {}]", current.speaker, current.text));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transcript(text: &str, lang: &str, logprob: f32, no_speech: f32) -> Transcript {
        Transcript {
            text: text.to_string(),
            language: Some(lang.to_string()),
            avg_logprob: Some(logprob),
            no_speech_prob: Some(no_speech),
        }
    }

    #[test]
    fn accepts_confident_spanish() {
        let t = transcript("vamos a la playa mañana", "es", -0.3, 0.1);
        assert!(accept_transcript(&t, MIN_WORDS_QUIET).is_ok());
    }

    #[test]
    fn drops_low_confidence() {
        let t = transcript("vamos a la playa mañana", "es", -0.75, 0.1);
        assert_eq!(accept_transcript(&t, 3), Err(DropReason::LowConfidence));
    }

    #[test]
    fn drops_no_speech() {
        let t = transcript("uh huh yeah sure thing", "en", -0.2, 0.8);
        assert_eq!(accept_transcript(&t, 3), Err(DropReason::NoSpeech));
    }

    #[test]
    fn drops_disallowed_language() {
        let t = transcript("je ne sais pas du tout", "fr", -0.2, 0.1);
        assert_eq!(accept_transcript(&t, 3), Err(DropReason::Language));
    }

    #[test]
    fn drops_short_when_noisy() {
        let t = transcript("sí claro bueno", "es", -0.2, 0.1);
        assert!(accept_transcript(&t, MIN_WORDS_QUIET).is_ok());
        assert_eq!(accept_transcript(&t, MIN_WORDS_NOISY), Err(DropReason::TooShort));
    }

    #[test]
    fn noise_baseline_window() {
        let mut baseline = NoiseBaseline::default();
        assert!(!baseline.is_noisy());
        for _ in 0..60 {
            baseline.record(2000.0);
        }
        assert!(baseline.is_noisy());
        assert_eq!(baseline.min_words(), MIN_WORDS_NOISY);
        assert!(baseline.window.len() <= 50);
    }

    #[test]
    fn wake_name_triggers_accent_insensitive() {
        let d = decide_trigger("Che JARVIS, ¿qué hora es?", "jarvis");
        assert!(d.respond);
        assert_eq!(d.reason, Some(TriggerReason::Name));

        let d = decide_trigger("oye járvis ayúdame con esto", "jarvis");
        assert_eq!(d.reason, Some(TriggerReason::Name));
    }

    #[test]
    fn wake_phrase_only_when_short() {
        let d = decide_trigger("oye, tengo una pregunta", "jarvis");
        assert_eq!(d.reason, Some(TriggerReason::WakePhrase));

        let long = "oye ".to_string() + &"bla ".repeat(30);
        assert!(!decide_trigger(&long, "jarvis").respond);
    }

    #[test]
    fn question_and_opinion_triggers() {
        assert_eq!(
            decide_trigger("I wonder, do you know the answer to this", "jarvis").reason,
            Some(TriggerReason::Question)
        );
        assert_eq!(
            decide_trigger("we liked it, what about you", "jarvis").reason,
            Some(TriggerReason::OpinionRequest)
        );
        assert!(!decide_trigger("estuvo buena la película", "jarvis").respond);
    }

    #[test]
    fn strip_wake_name_cleans_utterance() {
        assert_eq!(strip_wake_name("Che jarvis, ¿qué hora es?", "jarvis"), "¿qué hora es?");
        assert_eq!(strip_wake_name("jarvis, ¿qué hora es?", "jarvis"), "¿qué hora es?");
        // Name alone: keep the original rather than submit nothing
        assert_eq!(strip_wake_name("jarvis!", "jarvis"), "jarvis!");
    }

    #[test]
    fn self_intro_bilingual() {
        assert_eq!(detect_self_intro("hola, me llamo Lucía"), Some("Lucía".to_string()));
        assert_eq!(detect_self_intro("hey, my name is marcus by the way"), Some("Marcus".to_string()));
        assert_eq!(detect_self_intro("I'm Sofia"), Some("Sofia".to_string()));
    }

    #[test]
    fn self_intro_blacklist_and_length() {
        assert_eq!(detect_self_intro("I'm Sorry about that"), None);
        assert_eq!(detect_self_intro("soy yo"), None);
        assert_eq!(detect_self_intro("call me x"), None);
    }

    #[test]
    fn wrapper_excludes_current_and_orders() {
        let now = Utc::now();
        let entries = vec![
            AmbientEntry { text: "first".into(), speaker: "Ana".into(), is_owner: true, timestamp: now - chrono::Duration::seconds(60) },
            AmbientEntry { text: "second".into(), speaker: "Ben".into(), is_owner: false, timestamp: now - chrono::Duration::seconds(30) },
        ];
        let current = AmbientEntry { text: "what do you think".into(), speaker: "Ben".into(), is_owner: false, timestamp: now };
        let wrapped = ambient_wrapper(&entries, &current);
        assert!(wrapped.starts_with(AMBIENT_MARKER));
        assert!(wrapped.contains("Ana: first"));
        assert!(wrapped.contains("[Speaker just said: Ben: what do you think]"));
        let first_pos = wrapped.find("first").unwrap();
        let second_pos = wrapped.find("second").unwrap();
        assert!(first_pos < second_pos);
    }
}
