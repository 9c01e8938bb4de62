//! ASR adapter
//!
//! Packs raw PCM into a WAV container and submits it multipart to the
//! configured transcription endpoint. Prefers the OpenAI-compatible
//! dialect (text + language + per-segment confidences) and falls back to
//! the legacy path on 4xx; the first successful call pins the dialect for
//! the process.

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;
use reqwest::multipart;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio;
use crate::config::AsrConfig;

/// Per-request timeout
const ASR_TIMEOUT: Duration = Duration::from_secs(15);

/// Process-wide dialect election: the first path that succeeds wins
static PINNED_DIALECT: OnceCell<AsrDialect> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsrDialect {
    OpenAi,
    Legacy,
}

/// Transcription result with segment-level confidence aggregates
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub text: String,
    pub language: Option<String>,
    /// Mean of segment average log-probabilities
    pub avg_logprob: Option<f32>,
    /// Maximum segment no-speech probability
    pub no_speech_prob: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<OpenAiSegment>,
}

#[derive(Debug, Deserialize)]
struct OpenAiSegment {
    #[serde(default)]
    avg_logprob: Option<f32>,
    #[serde(default)]
    no_speech_prob: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct LegacyResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// HTTP client for the transcription endpoint
#[derive(Clone)]
pub struct AsrClient {
    client: reqwest::Client,
    config: AsrConfig,
}

impl AsrClient {
    pub fn new(config: AsrConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(ASR_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Transcribe a raw PCM blob (little-endian i16 mono).
    pub async fn transcribe(&self, pcm: &[u8], sample_rate: u32) -> Result<Transcript> {
        if pcm.is_empty() {
            return Ok(Transcript::default());
        }

        let wav = audio::pcm_to_wav(pcm, sample_rate)?;
        debug!("Submitting {} bytes of WAV ({:.1}s) for transcription",
            wav.len(), pcm.len() as f64 / (sample_rate as f64 * 2.0));

        match PINNED_DIALECT.get() {
            Some(AsrDialect::OpenAi) => self.transcribe_openai(wav).await,
            Some(AsrDialect::Legacy) => self.transcribe_legacy(wav).await,
            None => {
                match self.transcribe_openai(wav.clone()).await {
                    Ok(t) => {
                        let _ = PINNED_DIALECT.set(AsrDialect::OpenAi);
                        Ok(t)
                    }
                    Err(e) if is_client_error(&e) => {
                        warn!("OpenAI-compatible ASR path rejected, falling back to legacy: {}", e);
                        let t = self.transcribe_legacy(wav).await?;
                        let _ = PINNED_DIALECT.set(AsrDialect::Legacy);
                        Ok(t)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn transcribe_openai(&self, wav: Vec<u8>) -> Result<Transcript> {
        let part = multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .context("Invalid multipart mime")?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.config.url.trim_end_matches('/')))
            .multipart(form)
            .send()
            .await
            .context("ASR request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("ASR error ({}): {}", status, body);
        }

        let parsed: OpenAiResponse =
            response.json().await.context("Failed to parse ASR response")?;

        let avg_logprob = mean(parsed.segments.iter().filter_map(|s| s.avg_logprob));
        let no_speech_prob = parsed
            .segments
            .iter()
            .filter_map(|s| s.no_speech_prob)
            .fold(None, |acc: Option<f32>, p| Some(acc.map_or(p, |a| a.max(p))));

        let text = parsed.text.trim().to_string();
        info!("Transcribed: \"{}\" (lang={:?})", crate::truncate_safe(&text, 80), parsed.language);

        Ok(Transcript { text, language: parsed.language, avg_logprob, no_speech_prob })
    }

    async fn transcribe_legacy(&self, wav: Vec<u8>) -> Result<Transcript> {
        let part = multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .context("Invalid multipart mime")?;
        let form = multipart::Form::new().part("audio", part);

        let response = self
            .client
            .post(format!("{}/transcribe", self.config.url.trim_end_matches('/')))
            .multipart(form)
            .send()
            .await
            .context("ASR request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("ASR error ({}): {}", status, body);
        }

        let parsed: LegacyResponse =
            response.json().await.context("Failed to parse ASR response")?;

        let text = parsed.text.trim().to_string();
        info!("Transcribed (legacy): \"{}\"", crate::truncate_safe(&text, 80));

        // Legacy confidence maps onto the log-probability scale poorly;
        // expose it as-is when present so the filters still have a signal.
        Ok(Transcript {
            text,
            language: parsed.language,
            avg_logprob: parsed.confidence.map(|c| (c.clamp(0.001, 1.0)).ln()),
            no_speech_prob: None,
        })
    }
}

fn is_client_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    ["(400", "(401", "(403", "(404", "(405", "(415", "(422"]
        .iter()
        .any(|s| msg.contains(s))
}

fn mean(values: impl Iterator<Item = f32>) -> Option<f32> {
    let collected: Vec<f32> = values.collect();
    if collected.is_empty() {
        None
    } else {
        Some(collected.iter().sum::<f32>() / collected.len() as f32)
    }
}

// ─── Garbage filter ──────────────────────────────────────────

/// Hallucination phrases Whisper-family models emit on silence
const HALLUCINATIONS: &[&str] = &[
    "thanks for watching",
    "thank you for watching",
    "please subscribe",
    "don't forget to subscribe",
    "subtitles by",
    "gracias por ver",
    "suscríbete",
    "no olvides suscribirte",
    "subtítulos realizados por la comunidad de amara.org",
    "subtítulos por",
];

const ES_MARKERS: &[&str] = &["que", "de", "la", "el", "en", "es", "por", "los", "una", "pero"];
const EN_MARKERS: &[&str] = &["the", "is", "and", "of", "to", "that", "it", "you", "for", "but"];

/// Second-layer filter over transcripts that passed the confidence gates.
pub fn is_garbage(text: &str) -> bool {
    let lower = text.to_lowercase();
    let trimmed = lower.trim();
    if trimmed.is_empty() {
        return true;
    }

    if HALLUCINATIONS.iter().any(|h| trimmed.contains(h)) {
        return true;
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();

    // Repetitive short phrase: the same token looping
    if words.len() >= 6 {
        let distinct: std::collections::HashSet<&str> = words.iter().copied().collect();
        let ratio = distinct.len() as f32 / words.len() as f32;
        if ratio < 0.34 {
            return true;
        }
    }

    // Mixed-language soup: strong markers from both languages at once
    if words.len() >= 8 {
        let es = words.iter().filter(|w| ES_MARKERS.contains(w)).count();
        let en = words.iter().filter(|w| EN_MARKERS.contains(w)).count();
        let threshold = (words.len() / 4).max(2);
        if es >= threshold && en >= threshold {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hallucinations_are_garbage() {
        assert!(is_garbage("Thanks for watching!"));
        assert!(is_garbage("Gracias por ver el video, suscríbete"));
        assert!(is_garbage("Subtítulos realizados por la comunidad de Amara.org"));
    }

    #[test]
    fn repetition_is_garbage() {
        assert!(is_garbage("ya ya ya ya ya ya ya ya"));
        assert!(!is_garbage("no, creo que mañana vamos a la playa"));
    }

    #[test]
    fn mixed_language_soup_is_garbage() {
        assert!(is_garbage("the la que is de el and to por los it you una"));
    }

    #[test]
    fn normal_text_passes() {
        assert!(!is_garbage("¿Qué hora es?"));
        assert!(!is_garbage("Can you summarize the last meeting for me please"));
        assert!(is_garbage("   "));
    }

    #[test]
    fn mean_of_empty_is_none() {
        assert_eq!(mean(std::iter::empty()), None);
        let m = mean([-0.5f32, -0.7].into_iter()).unwrap();
        assert!((m + 0.6).abs() < 1e-6);
    }
}
