//! Streaming LLM client
//!
//! Two transports behind one streaming interface: a persistent duplex
//! WebSocket with run-level lifecycle events (preferred when configured)
//! and HTTP with server-sent incremental data events. The duplex
//! transport's `assistant.text` payloads may be cumulative; deltas are
//! normalized before emission.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::config::LlmConfig;

/// Content part for multimodal messages (text + images)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(data_uri: impl Into<String>) -> Self {
        ContentPart::ImageUrl { image_url: ImageUrl { url: data_uri.into() } }
    }
}

/// Message content: plain text or multimodal parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl ChatContent {
    /// Compact textual rendering used for history placeholders
    pub fn as_display_text(&self) -> String {
        match self {
            ChatContent::Text(t) => t.clone(),
            ChatContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// One message submitted to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: ChatContent,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: ChatContent::Text(content.into()) }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: ChatContent::Text(content.into()) }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: ChatContent::Text(content.into()) }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self { role: "user".to_string(), content: ChatContent::Parts(parts) }
    }
}

/// Event delivered by a streaming run
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Delta(String),
    Done,
    Error(String),
}

/// Handle to an in-flight streaming run.
///
/// Dropping the stream aborts the underlying transport task, which is how
/// cancellation propagates into the LLM call.
pub struct LlmStream {
    pub events: mpsc::Receiver<LlmEvent>,
    handle: tokio::task::JoinHandle<()>,
}

impl LlmStream {
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for LlmStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Normalize a duplex-transport text payload to an increment.
///
/// When the payload restates everything seen so far (cumulative stream),
/// the previously observed prefix is subtracted; otherwise the payload is
/// already an increment and passes through.
pub fn normalize_delta(seen: &str, incoming: &str) -> String {
    if !seen.is_empty() && incoming.starts_with(seen) {
        incoming[seen.len()..].to_string()
    } else {
        incoming.to_string()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Run lifecycle event on the duplex transport
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RunEvent {
    #[serde(rename = "run.started")]
    Started,
    #[serde(rename = "assistant.text")]
    Text {
        text: String,
    },
    #[serde(rename = "run.finished")]
    Finished,
    #[serde(rename = "run.error")]
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Streaming LLM client
#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self { client: reqwest::Client::new(), config }
    }

    /// Open a streaming run over the preferred transport.
    ///
    /// Deltas arrive on the returned channel in order; the channel closes
    /// after `Done` or `Error`.
    pub fn stream_chat(&self, messages: Vec<ChatMessage>) -> LlmStream {
        let (tx, rx) = mpsc::channel::<LlmEvent>(64);
        let config = self.config.clone();
        let client = self.client.clone();

        let handle = tokio::spawn(async move {
            let result = if config.ws_url.is_some() {
                run_duplex(&config, &messages, &tx).await
            } else {
                run_sse(&client, &config, &messages, &tx).await
            };
            match result {
                Ok(()) => {
                    let _ = tx.send(LlmEvent::Done).await;
                }
                Err(e) => {
                    warn!("LLM stream failed: {:#}", e);
                    let _ = tx.send(LlmEvent::Error(e.to_string())).await;
                }
            }
        });

        LlmStream { events: rx, handle }
    }
}

/// Duplex transport: one run per WebSocket connection, lifecycle events in.
async fn run_duplex(
    config: &LlmConfig,
    messages: &[ChatMessage],
    tx: &mpsc::Sender<LlmEvent>,
) -> Result<()> {
    let ws_url = config.ws_url.as_deref().context("Duplex transport not configured")?;

    let mut request = ws_url.into_client_request().context("Invalid LLM WebSocket URL")?;
    if let Some(key) = &config.api_key {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", key).parse().context("Invalid API key header")?,
        );
    }

    let (stream, _) = connect_async(request).await.context("LLM WebSocket connect failed")?;
    let (mut sink, mut source) = stream.split();

    let create = json!({
        "type": "run.create",
        "model": config.model,
        "max_tokens": config.max_tokens,
        "messages": messages,
    });
    sink.send(WsMessage::Text(create.to_string().into()))
        .await
        .context("Failed to submit run")?;

    // Cumulative-vs-incremental detection state
    let mut seen = String::new();

    while let Some(frame) = source.next().await {
        let frame = frame.context("LLM WebSocket read failed")?;
        let text = match frame {
            WsMessage::Text(t) => t,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<RunEvent>(&text) {
            Ok(RunEvent::Started) => debug!("LLM run started"),
            Ok(RunEvent::Text { text }) => {
                let delta = normalize_delta(&seen, &text);
                if !delta.is_empty() {
                    seen.push_str(&delta);
                    if tx.send(LlmEvent::Delta(delta)).await.is_err() {
                        // Receiver dropped: run cancelled
                        return Ok(());
                    }
                }
            }
            Ok(RunEvent::Finished) => return Ok(()),
            Ok(RunEvent::Error { message }) => bail!("LLM run error: {}", message),
            Ok(RunEvent::Other) => {}
            Err(e) => debug!("Unparsed LLM frame: {}", e),
        }
    }

    Ok(())
}

/// HTTP transport: server-sent incremental data events.
async fn run_sse(
    client: &reqwest::Client,
    config: &LlmConfig,
    messages: &[ChatMessage],
    tx: &mpsc::Sender<LlmEvent>,
) -> Result<()> {
    let http_url = config.http_url.as_deref().context("HTTP transport not configured")?;

    let request = ChatRequest {
        model: &config.model,
        messages,
        max_tokens: config.max_tokens,
        stream: true,
    };

    let mut builder = client.post(format!("{}/chat/completions", http_url.trim_end_matches('/')));
    if let Some(key) = &config.api_key {
        builder = builder.header("Authorization", format!("Bearer {}", key));
    }
    let response = builder
        .json(&request)
        .send()
        .await
        .context("Failed to send streaming request to LLM provider")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("LLM streaming API error ({}): {}", status, body);
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed to read stream chunk")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // Parse SSE events
        while let Some(pos) = buffer.find("\n\n") {
            let event_str = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();

            for line in event_str.lines() {
                if let Some(data) = line.strip_prefix("data: ") {
                    if data == "[DONE]" {
                        return Ok(());
                    }
                    if let Ok(resp) = serde_json::from_str::<StreamResponse>(data) {
                        if let Some(content) =
                            resp.choices.first().and_then(|c| c.delta.content.as_deref())
                        {
                            if !content.is_empty()
                                && tx.send(LlmEvent::Delta(content.to_string())).await.is_err()
                            {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
