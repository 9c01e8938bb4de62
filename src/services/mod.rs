//! External-service adapters
//!
//! Thin clients over the stream-oriented collaborators: the LLM (duplex or
//! SSE), the ASR and TTS engines, the speaker-ID microservice, and the
//! search endpoint. Each adapter owns its timeout and fallback policy; the
//! pipeline treats them as interchangeable seams.

pub mod asr;
pub mod llm;
pub mod search;
pub mod speaker;
pub mod tts;

use std::sync::Arc;

use crate::config::Config;

/// Bundle of adapter clients shared by every session
pub struct Services {
    pub llm: llm::LlmClient,
    pub asr: asr::AsrClient,
    pub tts: tts::TtsClient,
    pub speaker: speaker::SpeakerClient,
    pub search: search::SearchClient,
}

impl Services {
    pub fn from_config(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            llm: llm::LlmClient::new(config.llm.clone()),
            asr: asr::AsrClient::new(config.asr.clone()),
            tts: tts::TtsClient::new(config.tts.clone()),
            speaker: speaker::SpeakerClient::new(config.speaker.clone()),
            search: search::SearchClient::new(config.search.clone()),
        })
    }
}
