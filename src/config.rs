//! Configuration management
//!
//! Loads the server configuration from a TOML file and applies environment
//! overrides for every externally tunable knob: listen address, TLS, the
//! shared auth token, upstream service endpoints, wake-name defaults, and
//! the worker orchestrator limits.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub asr: AsrConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub speaker: SpeakerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM certificate path; TLS is enabled when both paths are set
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8750
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port(), tls_cert: None, tls_key: None }
    }
}

/// Shared-token authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared bearer token gating every connection; empty disables auth
    /// (local development only)
    #[serde(default)]
    pub token: String,
}

/// LLM endpoints and model selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible HTTP base URL (SSE transport)
    #[serde(default)]
    pub http_url: Option<String>,
    /// Duplex WebSocket URL (preferred transport when set)
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            http_url: None,
            ws_url: None,
            api_key: None,
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// ASR endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    #[serde(default = "default_asr_url")]
    pub url: String,
    #[serde(default = "default_asr_model")]
    pub model: String,
}

fn default_asr_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_asr_model() -> String {
    "whisper-1".to_string()
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self { url: default_asr_url(), model: default_asr_model() }
    }
}

/// TTS engine selection and per-engine endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Default engine for new sessions (cloud, gpu_fast, gpu_clone)
    #[serde(default = "default_tts_engine")]
    pub engine: String,
    #[serde(default)]
    pub cloud_url: Option<String>,
    #[serde(default)]
    pub gpu_fast_url: Option<String>,
    #[serde(default)]
    pub gpu_clone_url: Option<String>,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
}

fn default_tts_engine() -> String {
    "cloud".to_string()
}

fn default_tts_voice() -> String {
    "af_heart".to_string()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            engine: default_tts_engine(),
            cloud_url: None,
            gpu_fast_url: None,
            gpu_clone_url: None,
            voice: default_tts_voice(),
        }
    }
}

/// Speaker-ID microservice endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerConfig {
    #[serde(default = "default_speaker_url")]
    pub url: String,
}

fn default_speaker_url() -> String {
    "http://127.0.0.1:9100".to_string()
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self { url: default_speaker_url() }
    }
}

/// Search endpoint; colocated with the speaker-ID service by default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_speaker_url")]
    pub url: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { url: default_speaker_url() }
    }
}

/// Assistant persona defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Server-wide wake-name; each session may override it
    #[serde(default = "default_wake_name")]
    pub wake_name: String,
    #[serde(default)]
    pub owner_name: Option<String>,
}

fn default_wake_name() -> String {
    "jarvis".to_string()
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self { wake_name: default_wake_name(), owner_name: None }
    }
}

/// Worker orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Container image for meeting workers
    #[serde(default = "default_worker_image")]
    pub image: String,
    /// Container image for post-meeting summary workers
    #[serde(default)]
    pub summary_image: Option<String>,
    /// Container runtime socket path
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_max_meetings")]
    pub max_meetings: usize,
    /// First local port assigned to a worker's status endpoint
    #[serde(default = "default_status_port_base")]
    pub status_port_base: u16,
    /// Host directory holding per-meeting data (transcripts, recordings)
    #[serde(default = "default_worker_data_dir")]
    pub data_dir: PathBuf,
}

fn default_worker_image() -> String {
    "voxbridge/meet-worker:latest".to_string()
}

fn default_max_meetings() -> usize {
    3
}

fn default_status_port_base() -> u16 {
    9300
}

fn default_worker_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/voxbridge/meetings")
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: default_worker_image(),
            summary_image: None,
            socket: None,
            max_meetings: default_max_meetings(),
            status_port_base: default_status_port_base(),
            data_dir: default_worker_data_dir(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path or the default location,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            toml::from_str(&contents).context("Failed to parse config file")?
        } else {
            Config::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply `VOX_*` environment overrides.
    pub fn apply_env(&mut self) {
        set_string(&mut self.server.host, "VOX_HOST");
        if let Ok(port) = std::env::var("VOX_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        set_opt_path(&mut self.server.tls_cert, "VOX_TLS_CERT");
        set_opt_path(&mut self.server.tls_key, "VOX_TLS_KEY");
        set_string(&mut self.auth.token, "VOX_AUTH_TOKEN");

        set_opt_string(&mut self.llm.http_url, "VOX_LLM_HTTP_URL");
        set_opt_string(&mut self.llm.ws_url, "VOX_LLM_WS_URL");
        set_opt_string(&mut self.llm.api_key, "VOX_LLM_TOKEN");
        set_string(&mut self.llm.model, "VOX_LLM_MODEL");

        set_string(&mut self.asr.url, "VOX_ASR_URL");
        set_string(&mut self.tts.engine, "VOX_TTS_ENGINE");
        set_opt_string(&mut self.tts.cloud_url, "VOX_TTS_CLOUD_URL");
        set_opt_string(&mut self.tts.gpu_fast_url, "VOX_TTS_GPU_URL");
        set_opt_string(&mut self.tts.gpu_clone_url, "VOX_TTS_CLONE_URL");
        set_string(&mut self.speaker.url, "VOX_SPEAKER_URL");
        set_string(&mut self.search.url, "VOX_SEARCH_URL");

        set_string(&mut self.assistant.wake_name, "VOX_WAKE_NAME");
        set_opt_string(&mut self.assistant.owner_name, "VOX_OWNER_NAME");

        set_string(&mut self.worker.image, "VOX_WORKER_IMAGE");
        set_opt_string(&mut self.worker.summary_image, "VOX_WORKER_SUMMARY_IMAGE");
        set_opt_string(&mut self.worker.socket, "VOX_WORKER_SOCKET");
        if let Ok(max) = std::env::var("VOX_MAX_WORKERS") {
            if let Ok(m) = max.parse() {
                self.worker.max_meetings = m;
            }
        }
    }
}

fn set_string(target: &mut String, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn set_opt_string(target: &mut Option<String>, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *target = Some(value);
        }
    }
}

fn set_opt_path(target: &mut Option<PathBuf>, var: &str) {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            *target = Some(PathBuf::from(value));
        }
    }
}

/// Default configuration file path
pub fn default_config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voxbridge", "voxbridge")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}
