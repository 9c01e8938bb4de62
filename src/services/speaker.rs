//! Speaker-ID adapter
//!
//! Thin HTTP client over the sibling speaker-embedding microservice. Every
//! call times out briefly and never blocks the pipeline: on failure the
//! caller treats the speaker as unknown.

use anyhow::{bail, Context, Result};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::audio;
use crate::config::SpeakerConfig;

/// Per-request timeout
const SPEAKER_TIMEOUT: Duration = Duration::from_secs(3);

/// Identification result for one audio segment
#[derive(Debug, Clone, Deserialize)]
pub struct SpeakerIdentity {
    #[serde(rename = "speakerLabel")]
    pub label: String,
    #[serde(default)]
    pub known: bool,
    #[serde(default, rename = "hasProfiles")]
    pub has_profiles: bool,
    #[serde(default, rename = "autoEnrolling")]
    pub auto_enrolling: bool,
}

impl SpeakerIdentity {
    /// The identity assumed when the service is unreachable
    pub fn unknown() -> Self {
        Self {
            label: "Speaker".to_string(),
            known: false,
            has_profiles: true,
            auto_enrolling: false,
        }
    }

    /// Anonymous labels come back as "Speaker N" until enrolled or renamed
    pub fn is_anonymous(&self) -> bool {
        !self.known
    }
}

#[derive(Debug, Serialize)]
struct RenameRequest<'a> {
    old: &'a str,
    new: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProfilesResponse {
    #[serde(default)]
    profiles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OkResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the speaker-ID microservice
#[derive(Clone)]
pub struct SpeakerClient {
    client: reqwest::Client,
    config: SpeakerConfig,
}

impl SpeakerClient {
    pub fn new(config: SpeakerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SPEAKER_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Identify the speaker in a raw PCM segment.
    pub async fn identify(&self, pcm: &[u8], sample_rate: u32) -> Result<SpeakerIdentity> {
        let wav = audio::pcm_to_wav(pcm, sample_rate)?;
        let part = multipart::Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")
            .context("Invalid multipart mime")?;
        let form = multipart::Form::new().part("audio", part);

        let response = self
            .client
            .post(self.url("identify"))
            .multipart(form)
            .send()
            .await
            .context("Speaker-ID request failed")?;

        if !response.status().is_success() {
            bail!("Speaker-ID error ({})", response.status());
        }

        let identity: SpeakerIdentity =
            response.json().await.context("Failed to parse speaker identity")?;
        debug!("Identified speaker: {} (known={})", identity.label, identity.known);
        Ok(identity)
    }

    /// Enroll (or append samples to) a named voice profile.
    pub async fn enroll(&self, name: &str, pcm: &[u8], sample_rate: u32, append: bool) -> Result<()> {
        let wav = audio::pcm_to_wav(pcm, sample_rate)?;
        let part = multipart::Part::bytes(wav)
            .file_name("enroll.wav")
            .mime_str("audio/wav")
            .context("Invalid multipart mime")?;
        let form = multipart::Form::new()
            .part("audio", part)
            .text("name", name.to_string());

        let path = if append { "enroll_append" } else { "enroll" };
        let response = self
            .client
            .post(self.url(path))
            .multipart(form)
            .send()
            .await
            .context("Enroll request failed")?;

        self.check_ok(response).await?;
        info!("Enrolled profile '{}' (append={})", name, append);
        Ok(())
    }

    /// Rename a (typically anonymous) label to a proper name.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("rename"))
            .json(&RenameRequest { old, new })
            .send()
            .await
            .context("Rename request failed")?;
        self.check_ok(response).await?;
        info!("Renamed speaker '{}' -> '{}'", old, new);
        Ok(())
    }

    /// Drop every profile. Issued on fresh session creation so prior
    /// sessions do not contaminate identification.
    pub async fn reset(&self) -> Result<()> {
        let response = self
            .client
            .post(self.url("reset"))
            .json(&json!({}))
            .send()
            .await
            .context("Reset request failed")?;
        self.check_ok(response).await
    }

    /// List enrolled profile names.
    pub async fn profiles(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.url("profiles"))
            .send()
            .await
            .context("Profiles request failed")?;

        if !response.status().is_success() {
            bail!("Speaker-ID error ({})", response.status());
        }

        let parsed: ProfilesResponse =
            response.json().await.context("Failed to parse profiles")?;
        Ok(parsed.profiles)
    }

    async fn check_ok(&self, response: reqwest::Response) -> Result<()> {
        if !response.status().is_success() {
            bail!("Speaker-ID error ({})", response.status());
        }
        let parsed: OkResponse = response.json().await.unwrap_or(OkResponse { ok: true, error: None });
        if !parsed.ok {
            bail!("Speaker-ID rejected request: {}", parsed.error.unwrap_or_default());
        }
        Ok(())
    }
}
