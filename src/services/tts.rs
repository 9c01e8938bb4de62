//! TTS adapter
//!
//! Dispatches synthesis to the configured engine and falls back to the
//! cloud engine when a local GPU engine fails. The result is opaque audio
//! bytes; the session layer wraps them as base64.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TtsConfig;

/// Per-request synthesis timeout
const TTS_TIMEOUT: Duration = Duration::from_secs(30);

/// Closed set of synthesis engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsEngineId {
    /// Hosted engine, also the fallback target
    Cloud,
    /// Local GPU engine tuned for latency
    GpuFast,
    /// Local GPU engine with voice cloning
    GpuClone,
}

impl TtsEngineId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtsEngineId::Cloud => "cloud",
            TtsEngineId::GpuFast => "gpu_fast",
            TtsEngineId::GpuClone => "gpu_clone",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "cloud" => Some(TtsEngineId::Cloud),
            "gpu_fast" => Some(TtsEngineId::GpuFast),
            "gpu_clone" => Some(TtsEngineId::GpuClone),
            _ => None,
        }
    }

    pub fn all_names() -> &'static [&'static str] {
        &["cloud", "gpu_fast", "gpu_clone"]
    }
}

impl std::fmt::Display for TtsEngineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// HTTP client over the synthesis engines
#[derive(Clone)]
pub struct TtsClient {
    client: reqwest::Client,
    config: TtsConfig,
}

impl TtsClient {
    pub fn new(config: TtsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(TTS_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Synthesize text on the requested engine, falling back to cloud on
    /// any non-cloud failure.
    pub async fn synthesize(&self, engine: TtsEngineId, text: &str) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        match self.synthesize_on(engine, text).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if engine != TtsEngineId::Cloud => {
                warn!("TTS engine {} failed, falling back to cloud: {:#}", engine, e);
                self.synthesize_on(TtsEngineId::Cloud, text).await
            }
            Err(e) => Err(e),
        }
    }

    async fn synthesize_on(&self, engine: TtsEngineId, text: &str) -> Result<Vec<u8>> {
        let url = self.endpoint(engine)?;
        debug!("TTS ({}) synthesizing {} chars", engine, text.len());

        let request = SpeechRequest {
            input: text,
            voice: &self.config.voice,
            response_format: "wav",
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("TTS engine {} unreachable", engine))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("TTS engine {} error ({}): {}", engine, status, body);
        }

        let bytes = response
            .bytes()
            .await
            .context("Failed to read TTS response")?
            .to_vec();

        info!("TTS ({}) produced {} bytes", engine, bytes.len());
        Ok(bytes)
    }

    fn endpoint(&self, engine: TtsEngineId) -> Result<&str> {
        let url = match engine {
            TtsEngineId::Cloud => self.config.cloud_url.as_deref(),
            TtsEngineId::GpuFast => self.config.gpu_fast_url.as_deref(),
            TtsEngineId::GpuClone => self.config.gpu_clone_url.as_deref(),
        };
        url.with_context(|| format!("TTS engine {} has no configured endpoint", engine))
    }
}
