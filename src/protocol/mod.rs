//! Duplex client protocol
//!
//! JSON envelopes over a single WebSocket. Every message carries a `type`;
//! server-to-client envelopes additionally carry `sseq` and, on re-emission,
//! a `replay` flag. Unknown inbound types deserialize into a residual case
//! that the connection layer logs and drops.

pub mod emotion;
pub mod sentence;
pub mod tags;

pub use emotion::Emotion;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::types::DeviceCapabilities;
use tags::ButtonOption;

/// Client → server envelopes
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Auth {
        token: String,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        #[serde(default, rename = "lastServerSeq")]
        last_server_seq: Option<u64>,
    },
    Audio {
        data: String,
        #[serde(default)]
        prefix: Option<String>,
    },
    AmbientAudio {
        data: String,
    },
    Text {
        text: String,
        #[serde(default)]
        prefix: Option<String>,
    },
    Image {
        data: String,
        mime: String,
        #[serde(default)]
        caption: Option<String>,
    },
    File {
        data: String,
        name: String,
    },
    Cancel,
    BargeIn,
    ClearHistory,
    Replay,
    SetBotName {
        name: String,
    },
    EnrollAudio {
        data: String,
        name: String,
        #[serde(default)]
        append: bool,
    },
    GetProfiles,
    RenameSpeaker {
        old: String,
        new: String,
    },
    ResetSpeakers,
    SetTtsEngine {
        engine: String,
    },
    GetSettings,
    Ping,
    Capabilities {
        #[serde(flatten)]
        capabilities: DeviceCapabilities,
    },
    DeviceResponse {
        id: String,
        #[serde(default)]
        result: serde_json::Value,
    },
    /// Residual case for forward compatibility: logged and dropped
    #[serde(other)]
    Unknown,
}

/// Pipeline state visible to the client UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Transcribing,
    Thinking,
    Speaking,
}

/// Ambient listening state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmartState {
    Listening,
    Transcribing,
}

/// Server → client envelopes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Auth {
        status: String,
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "serverSeq")]
        server_seq: u64,
    },
    Status {
        state: PipelineState,
    },
    Transcript {
        text: String,
    },
    ReplyChunk {
        text: String,
        index: usize,
        emotion: Emotion,
    },
    AudioChunk {
        data: String,
        index: usize,
        emotion: Emotion,
        text: String,
    },
    StreamDone,
    StopPlayback,
    HistoryCleared,
    Emotion {
        emotion: Emotion,
    },
    AmbientTranscript {
        text: String,
        speaker: String,
        #[serde(rename = "isOwner")]
        is_owner: bool,
        #[serde(rename = "isKnown")]
        is_known: bool,
    },
    SmartStatus {
        state: SmartState,
    },
    Artifact {
        #[serde(rename = "artifactType")]
        artifact_type: String,
        content: String,
        language: String,
        title: String,
    },
    Buttons {
        options: Vec<ButtonOption>,
    },
    Settings {
        #[serde(rename = "wakeName")]
        wake_name: String,
        #[serde(rename = "ttsEngine")]
        tts_engine: String,
        #[serde(rename = "ownerName", skip_serializing_if = "Option::is_none")]
        owner_name: Option<String>,
    },
    TtsEngine {
        engine: String,
        status: String,
    },
    Profiles {
        profiles: Vec<String>,
    },
    EnrollResult {
        ok: bool,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    RenameResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ResetResult {
        ok: bool,
    },
    Error {
        message: String,
    },
    Pong,
    DeviceCommand {
        id: String,
        command: String,
        params: serde_json::Value,
    },
}

impl ServerEnvelope {
    /// Ephemeral envelopes are never added to the replay buffer
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ServerEnvelope::Pong | ServerEnvelope::SmartStatus { .. })
    }
}

/// An envelope already stamped and retained for replay
#[derive(Debug, Clone)]
pub struct SentEnvelope {
    pub sseq: u64,
    pub payload: ServerEnvelope,
}

/// Serialize an envelope into a wire frame with its sequence stamp.
pub fn encode_frame(envelope: &ServerEnvelope, sseq: u64, replay: bool) -> String {
    let mut value = serde_json::to_value(envelope)
        .unwrap_or_else(|_| json!({"type": "error", "message": "encode failure"}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("sseq".to_string(), json!(sseq));
        if replay {
            obj.insert("replay".to_string(), json!(true));
        }
    }
    value.to_string()
}

/// Parse an inbound text frame.
///
/// Returns the optional `cseq` dedup hint alongside the envelope. Malformed
/// JSON is a protocol error; an unrecognized `type` is not (it parses into
/// [`ClientEnvelope::Unknown`]).
pub fn parse_client_frame(text: &str) -> Result<(Option<u64>, ClientEnvelope)> {
    let value: serde_json::Value =
        serde_json::from_str(text).context("Malformed client envelope")?;
    let cseq = value.get("cseq").and_then(|v| v.as_u64());
    let envelope =
        ClientEnvelope::deserialize(&value).context("Client envelope missing fields")?;
    Ok((cseq, envelope))
}
